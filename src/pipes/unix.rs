//! POSIX descriptor layouts and the readiness-driven transfer tick.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Stdio;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::command::{escape_posix, join_argv_posix, replace_placeholders};
use crate::config::{CommandSpec, Config, Mode};
use crate::error::{Error, Result};
use crate::input::{InputPump, InputSource, PumpProgress, StdinSink};

use super::{CHUNK_SIZE, Channel, ChildHandle, READINESS_TIMEOUT, Target};

type BoxReadEnd = Box<dyn AsyncRead + Send + Unpin>;

/// A readable endpoint of the child: an async pipe, or the channel fed
/// by the pseudo-terminal reader.
enum ReadSource {
    Async(BoxReadEnd),
    Chan(mpsc::Receiver<Vec<u8>>),
}

enum ReadNow {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Failed(io::Error),
}

enum Ev {
    Data(Target, Vec<u8>),
    Eof(Target),
    ReadErr(Target, io::Error),
    Wrote(usize),
    WriteErr(io::Error),
    Tick,
}

/// Owns the child-facing descriptors on POSIX: chooses the layout for
/// the configured mode, composes the final `sh -c` command line
/// (including the sideband wrapping on constrained runtimes), and moves
/// bytes on every transfer tick.
pub(crate) struct PlatformPipes {
    mode: Mode,
    command: String,
    sideband: bool,
    input: Option<InputSource>,
    pump: InputPump,
    stdin: Option<StdinSink>,
    stdout: Option<ReadSource>,
    stderr: Option<ReadSource>,
    side: Option<ReadSource>,
    side_tx: Option<OwnedFd>,
    pty_master: Option<Box<dyn portable_pty::MasterPty + Send>>,
    /// Kept open for the lifetime of the pipes; some kernels recycle
    /// the pty pair early without an extra live handle.
    keepalive_guard: Option<std::fs::File>,
    stdin_closed: bool,
}

impl PlatformPipes {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let resolved_env = config.resolved_env();
        let base = match &config.command {
            CommandSpec::Argv(argv) => {
                if argv.is_empty() {
                    return Err(Error::invalid("the command argument vector is empty"));
                }
                join_argv_posix(argv)
            }
            CommandSpec::Shell(command) => {
                replace_placeholders(command, &resolved_env, escape_posix)?
            }
        };
        let sideband =
            config.sideband_requested() && !matches!(config.mode, Mode::Tty | Mode::Pty);
        let command = if sideband { wrap_sideband(&base) } else { base };

        Ok(PlatformPipes {
            mode: config.mode,
            command,
            sideband,
            input: config.input.clone(),
            pump: InputPump::new(config.input.clone()),
            stdin: None,
            stdout: None,
            stderr: None,
            side: None,
            side_tx: None,
            pty_master: None,
            keepalive_guard: None,
            stdin_closed: false,
        })
    }

    /// The final command string handed to the shell.
    pub(crate) fn command_line(&self) -> &str {
        &self.command
    }

    pub(crate) fn sideband_active(&self) -> bool {
        self.sideband
    }

    pub(crate) fn sideband_open(&self) -> bool {
        self.side.is_some()
    }

    pub(crate) fn read_ends_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some() || self.side.is_some()
    }

    pub(crate) fn stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    pub(crate) fn spawn(&mut self, config: &Config) -> Result<ChildHandle> {
        match self.mode {
            Mode::Pty => self.spawn_pty(config),
            _ => self.spawn_std(config),
        }
    }

    fn spawn_std(&mut self, config: &Config) -> Result<ChildHandle> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&self.command);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }
        for (name, value) in &config.env {
            match value {
                Some(v) => {
                    cmd.env(name, v);
                }
                None => {
                    cmd.env_remove(name);
                }
            }
        }
        match self.mode {
            Mode::Piped => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            Mode::OutputDisabled => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            Mode::Tty => {
                let tty = |write: bool| -> Result<std::fs::File> {
                    OpenOptions::new()
                        .read(!write)
                        .write(write)
                        .open("/dev/tty")
                        .map_err(|err| {
                            Error::runtime_io("failed to open /dev/tty for the child", err)
                        })
                };
                cmd.stdin(Stdio::from(tty(false)?))
                    .stdout(Stdio::from(tty(true)?))
                    .stderr(Stdio::from(tty(true)?));
            }
            Mode::Pty => unreachable!("pty spawning has its own path"),
        }
        if config.options.process_group {
            cmd.process_group(0);
        }
        cmd.kill_on_drop(false);

        if self.sideband {
            let (rx_fd, tx_fd) = sideband_pipe()
                .map_err(|err| Error::runtime_io("failed to open the sideband pipe", err))?;
            let raw_tx = tx_fd.as_raw_fd();
            // Runs between fork and exec: only dup2 is used, which is
            // async-signal-safe. The duplicate loses the close-on-exec
            // flag, so descriptor 3 survives into the shell.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(raw_tx, 3) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            let receiver = pipe::Receiver::from_owned_fd(rx_fd)
                .map_err(|err| Error::runtime_io("failed to register the sideband pipe", err))?;
            self.side = Some(ReadSource::Async(Box::new(receiver)));
            self.side_tx = Some(tx_fd);
            self.keepalive_guard = OpenOptions::new().read(true).open("/dev/null").ok();
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::runtime_io("Unable to launch a new process.", err))?;
        // Close the parent's copy of the sideband write end so EOF can
        // be observed once the shell exits.
        self.side_tx = None;

        match self.mode {
            Mode::Piped => {
                self.stdin = child.stdin.take().map(StdinSink::Pipe);
                self.stdout = child
                    .stdout
                    .take()
                    .map(|s| ReadSource::Async(Box::new(s) as BoxReadEnd));
                self.stderr = child
                    .stderr
                    .take()
                    .map(|s| ReadSource::Async(Box::new(s) as BoxReadEnd));
            }
            Mode::OutputDisabled => {
                self.stdin = child.stdin.take().map(StdinSink::Pipe);
            }
            Mode::Tty => {}
            Mode::Pty => unreachable!(),
        }
        debug!(command = %self.command, mode = ?self.mode, "child spawned");
        Ok(ChildHandle::Std(child))
    }

    fn spawn_pty(&mut self, config: &Config) -> Result<ChildHandle> {
        use portable_pty::{CommandBuilder, PtySize, native_pty_system};

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| Error::runtime(format!("failed to allocate a pseudo-terminal: {err}")))?;

        let mut builder = CommandBuilder::new("/bin/sh");
        builder.args(["-c", self.command.as_str()]);
        if let Some(dir) = &config.cwd {
            builder.cwd(dir);
        }
        for (name, value) in &config.env {
            match value {
                Some(v) => builder.env(name, v),
                None => builder.env_remove(name),
            }
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| Error::runtime(format!("Unable to launch a new process. {err}")))?;
        // The slave must go away in the parent, or the master never
        // reaches EOF after the child exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| Error::runtime(format!("failed to clone the pty reader: {err}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|err| Error::runtime(format!("failed to take the pty writer: {err}")))?;

        // The master endpoints block, so they get the only helper tasks
        // in the engine; both exit with the session.
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::task::spawn_blocking(move || {
            while let Some(data) = in_rx.blocking_recv() {
                if std::io::Write::write_all(&mut writer, &data).is_err() {
                    break;
                }
            }
        });

        self.stdin = Some(StdinSink::Channel(in_tx));
        self.stdout = Some(ReadSource::Chan(out_rx));
        self.pty_master = Some(pair.master);
        debug!(command = %self.command, "child spawned on a pseudo-terminal");
        Ok(ChildHandle::Pty(child))
    }

    /// One multiplexing tick: pump stdin, then collect whatever the
    /// child has produced. With `blocking` the tick parks on the
    /// readiness of any endpoint, bounded by [`READINESS_TIMEOUT`].
    ///
    /// POSIX endpoints close themselves at end of stream, so the
    /// `closing` hint has nothing left to do here; the Windows strategy
    /// uses it to defer tearing down its redirection files.
    pub(crate) async fn transfer(
        &mut self,
        blocking: bool,
        _closing: bool,
    ) -> Result<Vec<(Target, Vec<u8>)>> {
        self.pump_stdin().await?;
        let mut chunks = Vec::new();
        self.drain_ready(&mut chunks);
        if chunks.is_empty() && blocking && self.read_ends_open() {
            self.await_event(&mut chunks).await;
            self.drain_ready(&mut chunks);
        }
        Ok(chunks)
    }

    async fn pump_stdin(&mut self) -> Result<()> {
        if self.stdin_closed {
            return Ok(());
        }
        let Some(sink) = self.stdin.as_mut() else {
            return Ok(());
        };
        match self.pump.tick(sink).await {
            Ok(PumpProgress::EndOfFlow) => {
                self.close_stdin();
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(Error::Runtime {
                source: Some(ref err),
                ..
            }) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("child went away while its stdin was being fed");
                self.close_stdin();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Read everything that is available right now without suspending.
    fn drain_ready(&mut self, out: &mut Vec<(Target, Vec<u8>)>) {
        loop {
            let mut progressed = false;
            let mut failed = false;
            for (target, slot) in [
                (Target::Channel(Channel::Out), &mut self.stdout),
                (Target::Channel(Channel::Err), &mut self.stderr),
                (Target::Sideband, &mut self.side),
            ] {
                let Some(source) = slot.as_mut() else {
                    continue;
                };
                match read_now(source) {
                    ReadNow::Data(data) => {
                        out.push((target, data));
                        progressed = true;
                    }
                    ReadNow::WouldBlock => {}
                    ReadNow::Eof => {
                        trace!(?target, "output endpoint reached end of stream");
                        *slot = None;
                    }
                    ReadNow::Failed(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    ReadNow::Failed(err) => {
                        warn!(?target, "giving up on the child's pipes: {err}");
                        failed = true;
                    }
                }
            }
            if failed {
                self.drop_all();
                return;
            }
            if !progressed {
                return;
            }
        }
    }

    /// Park until any endpoint becomes ready, apply the one event that
    /// woke us, and return. The deadline keeps cancellation and the
    /// timeout clocks responsive.
    async fn await_event(&mut self, out: &mut Vec<(Target, Vec<u8>)>) {
        let pending: Option<Vec<u8>> = if self.stdin_closed {
            None
        } else {
            self.pump.pending().map(<[u8]>::to_vec)
        };

        let ev = {
            let stdout = &mut self.stdout;
            let stderr = &mut self.stderr;
            let side = &mut self.side;
            let stdin = &mut self.stdin;
            tokio::select! {
                biased;
                r = read_some(stdout) => classify(Target::Channel(Channel::Out), r),
                r = read_some(stderr) => classify(Target::Channel(Channel::Err), r),
                r = read_some(side) => classify(Target::Sideband, r),
                w = write_some(stdin, pending) => match w {
                    Ok(n) => Ev::Wrote(n),
                    Err(err) => Ev::WriteErr(err),
                },
                _ = tokio::time::sleep(READINESS_TIMEOUT) => Ev::Tick,
            }
        };

        match ev {
            Ev::Data(target, data) => out.push((target, data)),
            Ev::Eof(target) => {
                trace!(?target, "output endpoint reached end of stream");
                self.drop_target(target);
            }
            Ev::ReadErr(_, err) if err.kind() == io::ErrorKind::Interrupted => {}
            Ev::ReadErr(target, err) => {
                warn!(?target, "giving up on the child's pipes: {err}");
                self.drop_all();
            }
            Ev::Wrote(n) => self.pump.consume(n),
            Ev::WriteErr(err) => {
                debug!("child went away while its stdin was being fed: {err}");
                self.close_stdin();
            }
            Ev::Tick => {}
        }
    }

    fn drop_target(&mut self, target: Target) {
        match target {
            Target::Channel(Channel::Out) => self.stdout = None,
            Target::Channel(Channel::Err) => self.stderr = None,
            Target::Sideband => self.side = None,
        }
    }

    fn drop_all(&mut self) {
        self.stdout = None;
        self.stderr = None;
        self.side = None;
        self.close_stdin();
    }

    fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            self.stdin_closed = true;
            trace!("stdin endpoint closed");
        }
    }

    /// Drop every descriptor this strategy still owns.
    pub(crate) fn close(&mut self) {
        self.close_stdin();
        self.stdout = None;
        self.stderr = None;
        self.side = None;
        self.side_tx = None;
        self.pty_master = None;
        self.keepalive_guard = None;
    }

    /// Return to the pre-spawn state: everything closed, the pump
    /// re-armed on the configured input.
    pub(crate) fn reset(&mut self) {
        self.close();
        self.pump = InputPump::new(self.input.clone());
        self.stdin_closed = false;
    }
}

fn wrap_sideband(command: &str) -> String {
    format!(
        "{{ ({command}) <&3 3<&- 3>/dev/null & }} 3<&0; \
         pid=$!; echo $pid >&3; wait $pid; code=$?; echo $code >&3; exit $code"
    )
}

fn sideband_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    let (rx, tx) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(rx, libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(rx, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(tx, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) })
}

fn read_now(source: &mut ReadSource) -> ReadNow {
    match source {
        ReadSource::Async(reader) => {
            let mut buf = vec![0u8; CHUNK_SIZE];
            match reader.read(&mut buf).now_or_never() {
                None => ReadNow::WouldBlock,
                Some(Ok(0)) => ReadNow::Eof,
                Some(Ok(n)) => {
                    buf.truncate(n);
                    ReadNow::Data(buf)
                }
                Some(Err(err)) => ReadNow::Failed(err),
            }
        }
        ReadSource::Chan(rx) => match rx.try_recv() {
            Ok(data) => ReadNow::Data(data),
            Err(mpsc::error::TryRecvError::Empty) => ReadNow::WouldBlock,
            Err(mpsc::error::TryRecvError::Disconnected) => ReadNow::Eof,
        },
    }
}

async fn read_some(slot: &mut Option<ReadSource>) -> io::Result<Vec<u8>> {
    match slot {
        Some(ReadSource::Async(reader)) => {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let n = reader.read(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        }
        Some(ReadSource::Chan(rx)) => Ok(rx.recv().await.unwrap_or_default()),
        None => std::future::pending().await,
    }
}

async fn write_some(slot: &mut Option<StdinSink>, pending: Option<Vec<u8>>) -> io::Result<usize> {
    match (slot, pending) {
        (Some(StdinSink::Pipe(pipe)), Some(data)) => pipe.write(&data).await,
        (Some(StdinSink::Channel(tx)), Some(data)) => {
            let len = data.len();
            match tx.reserve().await {
                Ok(permit) => {
                    permit.send(data);
                    Ok(len)
                }
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "the stdin writer is gone",
                )),
            }
        }
        _ => std::future::pending().await,
    }
}

fn classify(target: Target, result: io::Result<Vec<u8>>) -> Ev {
    match result {
        Ok(data) if data.is_empty() => Ev::Eof(target),
        Ok(data) => Ev::Data(target, data),
        Err(err) => Ev::ReadErr(target, err),
    }
}

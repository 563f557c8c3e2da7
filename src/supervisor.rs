//! The lifecycle state machine owning one supervised child.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{Config, ExitRecord, Mode};
use crate::error::{Error, Result};
use crate::input::{Chunk, IntoChunk};
use crate::iter::IterState;
use crate::output::OutputBuffer;
use crate::pipes::{Channel, ChildHandle, PlatformPipes, RawStatus, Target};

/// Cadence of the busy-wait loops (exit reaping, kill grace).
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Grace period [`Supervisor::stop`] gives a child between the
/// termination signal and the forced kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;

// Conventional shell encoding of a signal death.
const EXIT_CODE_SIGNAL_BASE: i32 = 128;

/// Where a supervisor is in its lifecycle. `Terminated` is absorbing;
/// re-running takes a fresh instance via [`Supervisor::clone_ready`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Ready,
    Started,
    Waiting,
    Terminated,
}

impl State {
    pub(crate) fn is_live(self) -> bool {
        matches!(self, State::Started | State::Waiting)
    }
}

/// Exit facts assembled outside the spawn primitive: the pid and exit
/// code published on the sideband pipe, and the signals this supervisor
/// sent itself. Merged over the primitive's answer wherever the
/// primitive reports nothing.
#[derive(Clone, Copy, Debug, Default)]
struct FallbackRecord {
    pid: Option<i32>,
    exit_code: Option<i32>,
    signaled: bool,
    term_sig: Option<i32>,
}

type Callback<'a> = Option<&'a mut (dyn FnMut(Channel, &[u8]) + 'a)>;

/// Supervises one external process: spawn, I/O multiplexing, timeout
/// enforcement, signal dispatch, exit-status collection.
pub struct Supervisor {
    config: Config,
    state: State,
    pipes: Option<PlatformPipes>,
    child: Option<ChildHandle>,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_output: Option<Instant>,
    output: Option<OutputBuffer>,
    raw_status: Option<RawStatus>,
    exit: Option<ExitRecord>,
    fallback: FallbackRecord,
    latest_signal: Option<i32>,
    sideband_buf: Vec<u8>,
    pub(crate) iter: IterState,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Supervisor {
            config,
            state: State::Ready,
            pipes: None,
            child: None,
            pid: None,
            started_at: None,
            last_output: None,
            output: None,
            raw_status: None,
            exit: None,
            fallback: FallbackRecord::default(),
            latest_signal: None,
            sideband_buf: Vec::new(),
            iter: IterState::default(),
        }
    }

    /// Supervisor over a shell command string.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(Config::shell(command))
    }

    /// Supervisor over a pre-tokenized argument vector.
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Config::argv(argv))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable access to the configuration; refused while the child is
    /// running.
    pub fn config_mut(&mut self) -> Result<&mut Config> {
        if self.state.is_live() {
            return Err(Error::runtime(
                "the configuration cannot be changed while the process is running",
            ));
        }
        Ok(&mut self.config)
    }

    /// An independent `Ready` instance with the same configuration. The
    /// input source handle is shared; no pipe or child handle is.
    pub fn clone_ready(&self) -> Supervisor {
        Supervisor::new(self.config.clone())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn is_started(&self) -> bool {
        self.state != State::Ready
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// Spawn the child and enter `Started`.
    pub async fn start(&mut self) -> Result<()> {
        if self.state.is_live() {
            return Err(Error::runtime("the process is already running"));
        }
        self.reset_runtime();
        self.config.validate()?;
        let mut pipes = PlatformPipes::new(&self.config)?;
        let child = pipes.spawn(&self.config)?;
        self.pid = child.id();
        self.output = self.config.output_enabled().then(OutputBuffer::new);
        let now = Instant::now();
        self.started_at = Some(now);
        self.last_output = Some(now);
        self.child = Some(child);
        self.pipes = Some(pipes);
        self.state = State::Started;
        debug!(pid = ?self.pid, "supervision started");

        if self.pipes.as_ref().is_some_and(|p| p.sideband_active()) {
            self.read_sideband_pid().await?;
        }
        if self.config.mode == Mode::Tty {
            // Probing the status would block on the terminal.
            return Ok(());
        }
        self.update_status(false).await?;
        self.check_timeout().await?;
        Ok(())
    }

    /// Block until the child terminates, returning its exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        self.wait_impl(None).await
    }

    /// Like [`wait`](Self::wait), delivering every output chunk to
    /// `callback` as `(channel, bytes)` in arrival order.
    pub async fn wait_with<F>(&mut self, mut callback: F) -> Result<i32>
    where
        F: FnMut(Channel, &[u8]),
    {
        self.wait_impl(Some(&mut callback)).await
    }

    async fn wait_impl(&mut self, mut callback: Callback<'_>) -> Result<i32> {
        if self.state == State::Ready {
            return Err(Error::logic(
                "the process must be started before it can be waited on",
            ));
        }
        if callback.is_some() && !self.config.output_enabled() {
            return Err(Error::runtime(
                "Output has been disabled: a wait callback cannot observe chunks",
            ));
        }
        if self.state == State::Started {
            self.state = State::Waiting;
        }

        while self.read_pipes_open() {
            self.check_timeout().await?;
            let closing = !cfg!(windows) || !self.read_pipes_open();
            let chunks = match self.pipes.as_mut() {
                Some(pipes) => pipes.transfer(true, closing).await?,
                None => break,
            };
            self.absorb(chunks, &mut callback)?;
            self.refresh_raw_status()?;
        }

        // The readable endpoints are gone; poll the status (which keeps
        // feeding stdin for layouts with no readable endpoint at all)
        // until the child lands.
        loop {
            self.update_status(false).await?;
            if self.state == State::Terminated {
                break;
            }
            self.check_timeout().await?;
            sleep(POLL_INTERVAL).await;
        }

        let record = self
            .exit
            .ok_or_else(|| Error::runtime("the exit status is not available"))?;
        if record.signaled {
            let sig = record.term_sig.unwrap_or(-1);
            if self.latest_signal != Some(sig) {
                return Err(Error::runtime(format!(
                    "the process has been signaled with signal {sig}"
                )));
            }
        }
        Ok(record.exit_code)
    }

    /// Poll the spawn primitive, driving one transfer pass while the
    /// child still runs (a parked one when `blocking`). A child
    /// observed dead moves the machine to `Terminated`: remaining pipe
    /// content is drained, the pipes close, and the exit record is
    /// computed.
    pub async fn update_status(&mut self, blocking: bool) -> Result<()> {
        if !self.state.is_live() {
            return Ok(());
        }
        self.refresh_raw_status()?;
        if self.raw_status.is_some() {
            self.finish_terminated().await?;
            return Ok(());
        }
        let closing = !cfg!(windows) || !self.read_pipes_open();
        let chunks = match self.pipes.as_mut() {
            Some(pipes) => pipes.transfer(blocking, closing).await?,
            None => Vec::new(),
        };
        let idle = chunks.is_empty();
        self.absorb(chunks, &mut None)?;
        if blocking && idle && !self.read_pipes_open() {
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Whether the child is still alive. Refreshes the status first.
    pub async fn is_running(&mut self) -> Result<bool> {
        if !self.state.is_live() {
            return Ok(false);
        }
        self.update_status(false).await?;
        Ok(self.state.is_live())
    }

    /// Enforce both clocks. When both have expired in the same tick,
    /// the one whose deadline passed first wins. Expiry kills the child
    /// with no grace and surfaces the matching error kind.
    pub async fn check_timeout(&mut self) -> Result<()> {
        if !self.state.is_live() {
            return Ok(());
        }
        let now = Instant::now();
        let mut expired: Option<(Instant, Error)> = None;
        if let (Some(limit), Some(started)) = (self.config.timeout, self.started_at) {
            let deadline = started + limit;
            if now > deadline {
                expired = Some((deadline, Error::Timeout { limit }));
            }
        }
        if let (Some(limit), Some(last)) = (self.config.idle_timeout, self.last_output) {
            let deadline = last + limit;
            if now > deadline && expired.as_ref().map(|(d, _)| deadline < *d).unwrap_or(true) {
                expired = Some((deadline, Error::IdleTimeout { limit }));
            }
        }
        if let Some((_, err)) = expired {
            warn!(error = %err, "clock expired, killing the child");
            let _ = self.kill(Duration::ZERO, None).await;
            return Err(err);
        }
        Ok(())
    }

    /// [`kill`](Self::kill) with the default grace period.
    pub async fn stop(&mut self) -> Result<i32> {
        self.kill(DEFAULT_KILL_GRACE, None).await
    }

    /// Terminate the child: send the termination signal, poll for up to
    /// `grace`, escalate to `signal` (or a forced kill), then signal
    /// the sideband pid if the wrapping shell still shields the child,
    /// and finally force-close. Returns the exit code.
    pub async fn kill(&mut self, grace: Duration, signal: Option<i32>) -> Result<i32> {
        if self.is_running().await? {
            let _ = self.do_signal(SIGTERM, false);
            let deadline = Instant::now() + grace;
            while self.is_running().await? && Instant::now() < deadline {
                sleep(POLL_INTERVAL).await;
            }
            if self.is_running().await? {
                let sig = signal.unwrap_or(SIGKILL);
                warn!(signal = sig, "child survived the grace period, escalating");
                let _ = self.do_signal(sig, false);
                sleep(POLL_INTERVAL).await;
                if self.is_running().await? {
                    if let Some(pid) = self.fallback.pid {
                        // The wrapping shell layer may have absorbed the
                        // signal; deliver to the real child directly.
                        let _ = self.signal_pid(pid, sig);
                    }
                }
                if self.is_running().await? {
                    if let Some(child) = self.child.as_mut() {
                        let _ = child.force_kill();
                    }
                }
            }
        }
        while self.state.is_live() {
            self.update_status(false).await?;
            if !self.state.is_live() {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(self.exit.map(|r| r.exit_code).unwrap_or(-1))
    }

    /// Deliver signal `sig` to the running child. On Windows only
    /// `taskkill` termination is available, whatever the number.
    pub async fn signal(&mut self, sig: i32) -> Result<()> {
        if !self.is_running().await? {
            return Err(Error::logic(
                "cannot send a signal to a process that is not running",
            ));
        }
        self.do_signal(sig, true)?;
        Ok(())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.map(|r| r.exit_code)
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.exit
    }

    pub fn is_successful(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// Whether the child died to a signal. Only answerable once
    /// terminated.
    pub fn is_signaled(&self) -> Result<bool> {
        let record = self.require_terminated()?;
        Ok(record.signaled)
    }

    /// The signal that terminated the child. When the runtime masked
    /// the signal number, this reports the `Runtime` kind to keep the
    /// masking observable.
    pub fn term_signal(&self) -> Result<i32> {
        let record = self.require_terminated()?;
        if !record.signaled {
            return Err(Error::logic("the process was not terminated by a signal"));
        }
        match record.term_sig {
            Some(sig) if sig >= 0 => Ok(sig),
            _ => Err(Error::runtime(
                "child signal information is unavailable on this runtime",
            )),
        }
    }

    /// Everything the child wrote to stdout so far.
    pub fn output(&mut self) -> Result<Vec<u8>> {
        self.buffered_bytes(Channel::Out)
    }

    /// Everything the child wrote to stderr so far.
    pub fn error_output(&mut self) -> Result<Vec<u8>> {
        self.buffered_bytes(Channel::Err)
    }

    /// Stdout as text, lossily decoded.
    pub fn output_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.output()?).into_owned())
    }

    /// Stderr as text, lossily decoded.
    pub fn error_output_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.error_output()?).into_owned())
    }

    /// Stdout as a rewound read handle over the bytes captured so far.
    pub fn output_reader(&mut self) -> Result<std::io::Cursor<Vec<u8>>> {
        Ok(std::io::Cursor::new(self.output()?))
    }

    /// Stderr as a rewound read handle over the bytes captured so far.
    pub fn error_output_reader(&mut self) -> Result<std::io::Cursor<Vec<u8>>> {
        Ok(std::io::Cursor::new(self.error_output()?))
    }

    pub fn clear_output(&mut self) -> Result<()> {
        self.require_output()?.clear(Channel::Out);
        self.iter.reset_channel(Channel::Out);
        Ok(())
    }

    pub fn clear_error_output(&mut self) -> Result<()> {
        self.require_output()?.clear(Channel::Err);
        self.iter.reset_channel(Channel::Err);
        Ok(())
    }

    fn buffered_bytes(&mut self, channel: Channel) -> Result<Vec<u8>> {
        self.require_output()?
            .bytes(channel)
            .map_err(|err| Error::runtime_io("failed to read buffered output", err))
    }

    pub(crate) fn read_output_at(
        &mut self,
        channel: Channel,
        offset: u64,
        max: usize,
    ) -> Result<Vec<u8>> {
        let Some(buffer) = self.output.as_mut() else {
            return Ok(Vec::new());
        };
        buffer
            .read_at(channel, offset, max)
            .map_err(|err| Error::runtime_io("failed to read buffered output", err))
    }

    fn require_output(&mut self) -> Result<&mut OutputBuffer> {
        if !self.config.output_enabled() {
            return Err(Error::logic("Output has been disabled."));
        }
        self.output.as_mut().ok_or_else(|| {
            Error::logic("the process must be started before its output can be accessed")
        })
    }

    fn require_terminated(&self) -> Result<ExitRecord> {
        self.exit.ok_or_else(|| {
            Error::logic("the process must be terminated before its exit status can be read")
        })
    }

    fn reset_runtime(&mut self) {
        self.state = State::Ready;
        if let Some(mut pipes) = self.pipes.take() {
            // Returns the old strategy's descriptors (and, on Windows,
            // unlinks its redirection files) before the replacement is
            // armed.
            pipes.reset();
        }
        self.child = None;
        self.pid = None;
        self.started_at = None;
        self.last_output = None;
        self.output = None;
        self.raw_status = None;
        self.exit = None;
        self.fallback = FallbackRecord::default();
        self.latest_signal = None;
        self.sideband_buf.clear();
        self.iter.rewind();
    }

    fn read_pipes_open(&self) -> bool {
        self.pipes.as_ref().is_some_and(|p| p.read_ends_open())
    }

    /// Whether the write end of the child's stdin is still open (the
    /// input source has not been fully delivered).
    pub fn stdin_open(&self) -> bool {
        self.pipes.as_ref().is_some_and(|p| p.stdin_open())
    }

    fn refresh_raw_status(&mut self) -> Result<()> {
        if self.raw_status.is_some() {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            self.raw_status = child
                .try_status()
                .map_err(|err| Error::runtime_io("failed to poll the child status", err))?;
        }
        Ok(())
    }

    /// The child's pid arrives as the first sideband line; block until
    /// it does (or the sideband dies with the child).
    async fn read_sideband_pid(&mut self) -> Result<()> {
        loop {
            if self.fallback.pid.is_some() {
                return Ok(());
            }
            let Some(pipes) = self.pipes.as_mut() else {
                return Ok(());
            };
            if !pipes.sideband_open() {
                return Ok(());
            }
            let chunks = pipes.transfer(true, false).await?;
            self.absorb(chunks, &mut None)?;
        }
    }

    async fn finish_terminated(&mut self) -> Result<()> {
        loop {
            let Some(pipes) = self.pipes.as_mut() else {
                break;
            };
            let chunks = pipes.transfer(false, true).await?;
            if chunks.is_empty() {
                break;
            }
            self.absorb(chunks, &mut None)?;
        }
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close();
        }
        self.child = None;
        self.state = State::Terminated;
        self.finalize_exit();
        debug!(exit = ?self.exit, "supervision terminated");
        Ok(())
    }

    /// Merge the primitive's status with the fallback record. The
    /// sideband and self-sent signals win wherever the primitive came
    /// back with nothing, and a signal death with no usable code is
    /// encoded as `128 + signal`.
    fn finalize_exit(&mut self) {
        let raw = self.raw_status.unwrap_or_default();
        let signaled = self.fallback.signaled || raw.signal.is_some();
        let term_sig = self.fallback.term_sig.or(raw.signal);
        let mut code = raw.code.unwrap_or(-1);
        if code == -1 {
            if let Some(fb) = self.fallback.exit_code {
                if fb != -1 {
                    code = fb;
                }
            }
        }
        if code == -1 && signaled {
            if let Some(sig) = term_sig {
                if sig > 0 {
                    code = EXIT_CODE_SIGNAL_BASE + sig;
                }
            }
        }
        self.exit = Some(ExitRecord {
            exit_code: code,
            signaled,
            term_sig,
            running: false,
        });
    }

    fn absorb(&mut self, chunks: Vec<(Target, Vec<u8>)>, callback: &mut Callback<'_>) -> Result<()> {
        for (target, data) in chunks {
            match target {
                Target::Sideband => self.ingest_sideband(&data),
                Target::Channel(channel) => {
                    self.last_output = Some(Instant::now());
                    if let Some(buffer) = self.output.as_mut() {
                        buffer.add(channel, &data).map_err(|err| {
                            Error::runtime_io("failed to record child output", err)
                        })?;
                    }
                    if let Some(cb) = callback.as_mut() {
                        cb(channel, &data);
                    }
                }
            }
        }
        Ok(())
    }

    /// The wrapping shell writes two integer lines on descriptor 3: the
    /// child pid, then the exit code of `wait`.
    fn ingest_sideband(&mut self, data: &[u8]) {
        self.sideband_buf.extend_from_slice(data);
        while let Some(pos) = self.sideband_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.sideband_buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let Ok(value) = text.trim().parse::<i32>() else {
                continue;
            };
            if self.fallback.pid.is_none() {
                self.fallback.pid = Some(value);
                debug!(pid = value, "sideband reported the child pid");
            } else if self.fallback.exit_code.is_none() {
                self.fallback.exit_code = Some(value);
                debug!(code = value, "sideband reported the exit code");
            }
        }
    }

    fn do_signal(&mut self, sig: i32, throw: bool) -> Result<bool> {
        let Some(pid) = self.pid else {
            if throw {
                return Err(Error::logic("cannot signal a process without a pid"));
            }
            return Ok(false);
        };
        match self.signal_pid(pid as i32, sig) {
            Ok(()) => {
                self.latest_signal = Some(sig);
                if self.config.sideband_requested() {
                    // The primitive will not report the signal; keep
                    // the cause observable through the fallback record.
                    self.fallback.signaled = true;
                    self.fallback.exit_code.get_or_insert(-1);
                    self.fallback.term_sig = Some(sig);
                }
                Ok(true)
            }
            Err(err) => {
                if throw {
                    Err(err)
                } else {
                    debug!(signal = sig, error = %err, "signal delivery failed");
                    Ok(false)
                }
            }
        }
    }

    #[cfg(unix)]
    fn signal_pid(&self, pid: i32, sig: i32) -> Result<()> {
        if unsafe { libc::kill(pid, sig) } == 0 {
            return Ok(());
        }
        let primary = std::io::Error::last_os_error();
        // Subordinate spawn as the delivery path of last resort.
        let delivered = std::process::Command::new("kill")
            .arg(format!("-{sig}"))
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if delivered {
            Ok(())
        } else {
            Err(Error::runtime_io(
                format!("error while sending signal {sig} to pid {pid}"),
                primary,
            ))
        }
    }

    #[cfg(windows)]
    fn signal_pid(&self, pid: i32, _sig: i32) -> Result<()> {
        let delivered = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if delivered {
            Ok(())
        } else {
            Err(Error::runtime(format!(
                "error while terminating pid {pid} with taskkill"
            )))
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.state.is_live() {
            return;
        }
        debug!(pid = ?self.pid, "supervisor dropped with a live child, forcing termination");
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, SIGTERM);
                libc::kill(pid as i32, SIGKILL);
            }
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.force_kill();
        }
        if let Some(pipes) = self.pipes.as_mut() {
            pipes.close();
        }
    }
}

/// A supervisor can itself be an input chunk: the child it runs feeds
/// the outer child's stdin with its standard output.
impl IntoChunk for Supervisor {
    fn into_chunk(self) -> Result<Option<Chunk>> {
        Ok(Some(Chunk::Process(Box::new(self))))
    }
}

//! Windows descriptor layout: temp-file redirection behind `cmd`.
//!
//! Anonymous pipes starve under cmd's buffering, so stdout and stderr
//! are redirected into two uniquely named temp files that are read at a
//! tracked offset and unlinked when the pipes close. Input stays a real
//! pipe.

use std::io::{self, Read, Seek, SeekFrom};
use std::process::Stdio;

use tracing::{debug, trace};

use crate::command::{escape_windows, join_argv_windows, replace_placeholders};
use crate::config::{CommandSpec, Config, Mode};
use crate::error::{Error, Result};
use crate::input::{InputPump, InputSource, PumpProgress, StdinSink};

use super::{CHUNK_SIZE, Channel, ChildHandle, READINESS_TIMEOUT, Target};

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

struct RedirFile {
    file: std::fs::File,
    path: tempfile::TempPath,
    offset: u64,
}

impl RedirFile {
    fn create(label: &str) -> Result<Self> {
        let named = tempfile::Builder::new()
            .prefix(&format!("procmux-{label}-"))
            .suffix(".tmp")
            .tempfile()
            .map_err(|err| Error::runtime_io("failed to create a redirection file", err))?;
        let (file, path) = named.into_parts();
        Ok(RedirFile {
            file,
            path,
            offset: 0,
        })
    }

    /// New bytes appended by the child since the last read.
    fn read_new(&mut self) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        self.offset += n as u64;
        Ok(buf)
    }
}

/// Owns the child-facing descriptors on Windows and composes the
/// `cmd /V:ON /E:ON /D /C (...)` command line, smuggling shell-unsafe
/// string literals through delayed-expansion environment variables.
pub(crate) struct PlatformPipes {
    mode: Mode,
    command: String,
    /// `!varN!` values injected into the child environment.
    smuggled_env: Vec<(String, String)>,
    input: Option<InputSource>,
    pump: InputPump,
    stdin: Option<StdinSink>,
    out_file: Option<RedirFile>,
    err_file: Option<RedirFile>,
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
                join_argv_windows(argv)
            }
            CommandSpec::Shell(command) => {
                replace_placeholders(command, &resolved_env, escape_windows)?
            }
        };
        let mut smuggled_env = Vec::new();
        let command = smuggle_unsafe_literals(&base, &mut smuggled_env);

        Ok(PlatformPipes {
            mode: config.mode,
            command,
            smuggled_env,
            input: config.input.clone(),
            pump: InputPump::new(config.input.clone()),
            stdin: None,
            out_file: None,
            err_file: None,
            stdin_closed: false,
        })
    }

    pub(crate) fn command_line(&self) -> &str {
        &self.command
    }

    pub(crate) fn sideband_active(&self) -> bool {
        false
    }

    pub(crate) fn sideband_open(&self) -> bool {
        false
    }

    pub(crate) fn read_ends_open(&self) -> bool {
        self.out_file.is_some() || self.err_file.is_some()
    }

    pub(crate) fn stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    pub(crate) fn spawn(&mut self, config: &Config) -> Result<ChildHandle> {
        // The spawn options are forced: errors suppressed, no second
        // shell layer around the one composed here.
        let mut options = config.options;
        options.suppress_errors = true;
        options.bypass_shell = true;

        let redirect = if config.mode == Mode::OutputDisabled {
            "1>NUL 2>NUL".to_string()
        } else {
            let out = RedirFile::create("out")?;
            let err = RedirFile::create("err")?;
            let line = format!(
                "1>\"{}\" 2>\"{}\"",
                out.path.display(),
                err.path.display()
            );
            self.out_file = Some(out);
            self.err_file = Some(err);
            line
        };

        let mut cmd = tokio::process::Command::new("cmd");
        cmd.args(["/V:ON", "/E:ON", "/D", "/C"]);
        cmd.raw_arg(format!("({}) {redirect}", self.command));
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
        for (name, value) in &self.smuggled_env {
            cmd.env(name, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if options.suppress_errors || options.create_no_window {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd.kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::runtime_io("Unable to launch a new process.", err))?;
        self.stdin = child.stdin.take().map(StdinSink::Pipe);
        debug!(command = %self.command, mode = ?self.mode, "child spawned behind cmd");
        Ok(ChildHandle::Std(child))
    }

    /// One multiplexing tick. The redirection files have no readiness
    /// to park on, so a blocking tick that finds nothing simply sleeps
    /// out the readiness deadline. With `closing`, a pass that drains
    /// nothing tears the files down and unlinks them.
    pub(crate) async fn transfer(
        &mut self,
        blocking: bool,
        closing: bool,
    ) -> Result<Vec<(Target, Vec<u8>)>> {
        self.pump_stdin().await?;
        let mut chunks = Vec::new();
        self.drain(&mut chunks)?;
        if chunks.is_empty() && blocking && self.read_ends_open() {
            tokio::time::sleep(READINESS_TIMEOUT).await;
            self.drain(&mut chunks)?;
        }
        if closing && chunks.is_empty() {
            self.close();
        }
        Ok(chunks)
    }

    fn drain(&mut self, out: &mut Vec<(Target, Vec<u8>)>) -> Result<()> {
        for (channel, slot) in [
            (Channel::Out, &mut self.out_file),
            (Channel::Err, &mut self.err_file),
        ] {
            let Some(file) = slot.as_mut() else {
                continue;
            };
            loop {
                match file.read_new() {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => out.push((Target::Channel(channel), data)),
                    Err(err) => {
                        return Err(Error::runtime_io(
                            "failed to read a redirection file",
                            err,
                        ));
                    }
                }
            }
        }
        Ok(())
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

    fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            self.stdin_closed = true;
            trace!("stdin endpoint closed");
        }
    }

    /// Drop the pipe and unlink the redirection files.
    pub(crate) fn close(&mut self) {
        self.close_stdin();
        self.out_file = None;
        self.err_file = None;
    }

    /// Return to the pre-spawn state: files unlinked, the pump re-armed
    /// on the configured input.
    pub(crate) fn reset(&mut self) {
        self.close();
        self.pump = InputPump::new(self.input.clone());
        self.stdin_closed = false;
    }
}

/// Replace double-quoted literals containing cmd metacharacters with
/// `!varN!` references whose exact bytes travel through the child
/// environment, immune to cmd's quoting rules. NUL bytes cannot cross
/// `CreateProcess` and become `?`.
fn smuggle_unsafe_literals(command: &str, env: &mut Vec<(String, String)>) -> String {
    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    let mut counter = 0usize;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('"') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let literal = &after[..end];
        if literal
            .chars()
            .any(|c| matches!(c, '"' | '%' | '!' | '^' | '\n'))
        {
            counter += 1;
            let name = format!("PMX_ARG_{counter}");
            env.push((name.clone(), literal.replace('\0', "?")));
            out.push_str(&format!("!{name}!"));
        } else {
            out.push('"');
            out.push_str(literal);
            out.push('"');
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

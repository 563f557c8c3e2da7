//! Platform pipe strategies: descriptor layout, final command string,
//! and the multiplexing transfer tick.

use std::fmt;
use std::io;
use std::time::Duration;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::PlatformPipes;
#[cfg(windows)]
pub(crate) use windows::PlatformPipes;

/// Bytes moved per read or write attempt.
pub(crate) const CHUNK_SIZE: usize = 8192;

/// Deadline of one blocking readiness pass.
pub(crate) const READINESS_TIMEOUT: Duration = Duration::from_millis(100);

/// An output channel of the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Out,
    Err,
}

impl Channel {
    /// Stable string label, used as the iteration key.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Out => "out",
            Channel::Err => "err",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transferred chunk came from. The sideband carries the
/// wrapping shell's pid/exit-code lines and never reaches the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Channel(Channel),
    Sideband,
}

/// What the spawn primitive knows about the child right now.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RawStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// The spawned child, unified over the plain and pseudo-terminal spawn
/// paths.
pub(crate) enum ChildHandle {
    Std(tokio::process::Child),
    #[cfg(unix)]
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ChildHandle {
    pub(crate) fn id(&self) -> Option<u32> {
        match self {
            ChildHandle::Std(child) => child.id(),
            #[cfg(unix)]
            ChildHandle::Pty(child) => child.process_id(),
        }
    }

    /// Non-blocking status poll. `Ok(None)` while the child is still
    /// running.
    pub(crate) fn try_status(&mut self) -> io::Result<Option<RawStatus>> {
        match self {
            ChildHandle::Std(child) => Ok(child.try_wait()?.map(raw_status)),
            #[cfg(unix)]
            ChildHandle::Pty(child) => Ok(child
                .try_wait()?
                .map(|status| RawStatus {
                    code: Some(status.exit_code() as i32),
                    signal: None,
                })),
        }
    }

    /// Force-terminate without waiting.
    pub(crate) fn force_kill(&mut self) -> io::Result<()> {
        match self {
            ChildHandle::Std(child) => child.start_kill(),
            #[cfg(unix)]
            ChildHandle::Pty(child) => child.kill(),
        }
    }
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildHandle::Std(child) => f.debug_tuple("Std").field(&child.id()).finish(),
            #[cfg(unix)]
            ChildHandle::Pty(child) => f.debug_tuple("Pty").field(&child.process_id()).finish(),
        }
    }
}

fn raw_status(status: std::process::ExitStatus) -> RawStatus {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    RawStatus {
        code: status.code(),
        signal,
    }
}

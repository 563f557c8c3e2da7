//! Host capability probing, cached at first use.
//!
//! The supervisor consults these answers instead of hard-coding platform
//! assumptions: whether a controlling terminal or a pseudo-terminal can
//! actually be handed to a child, and whether the runtime needs the
//! sideband exit channel because the native wait status masks signal
//! termination.

use std::sync::OnceLock;

/// Environment variable forcing the sideband exit channel on. Intended
/// for hosts (and tests) where signal visibility must not rely on the
/// native wait status.
pub const EXIT_SIDEBAND_ENV: &str = "PROCMUX_EXIT_SIDEBAND";

#[derive(Debug, Default)]
pub struct Capabilities {
    tty: OnceLock<bool>,
    pty: OnceLock<bool>,
    constrained: OnceLock<bool>,
    missing: OnceLock<Option<&'static str>>,
}

static CAPS: OnceLock<Capabilities> = OnceLock::new();

/// Process-wide capability oracle.
pub fn capabilities() -> &'static Capabilities {
    CAPS.get_or_init(Capabilities::default)
}

impl Capabilities {
    pub fn is_windows(&self) -> bool {
        cfg!(windows)
    }

    /// Whether a child can be bound to the controlling terminal.
    pub fn tty_supported(&self) -> bool {
        *self.tty.get_or_init(probe_tty)
    }

    /// Whether a pseudo-terminal pair can be allocated for a child.
    pub fn pty_supported(&self) -> bool {
        *self.pty.get_or_init(probe_pty)
    }

    /// Whether the runtime masks child signal termination, requiring the
    /// sideband exit channel. The native wait status on this toolchain
    /// reports signals, so this answers `false` unless overridden via
    /// [`EXIT_SIDEBAND_ENV`].
    pub fn constrained_child(&self) -> bool {
        *self.constrained.get_or_init(|| {
            std::env::var_os(EXIT_SIDEBAND_ENV)
                .map(|v| v != "0" && !v.is_empty())
                .unwrap_or(false)
        })
    }

    /// Reports the one external spawn primitive the pipe strategies
    /// require, if it is missing from the host: the wrapping shell.
    pub fn missing_spawn_primitive(&self) -> Option<&'static str> {
        *self.missing.get_or_init(probe_shell)
    }
}

#[cfg(unix)]
fn probe_tty() -> bool {
    use std::fs::OpenOptions;
    use std::process::{Command, Stdio};

    let open = |write: bool| {
        OpenOptions::new()
            .read(!write)
            .write(write)
            .open("/dev/tty")
    };
    let (Ok(input), Ok(out), Ok(err)) = (open(false), open(true), open(true)) else {
        return false;
    };
    // A throwaway spawn tells us whether the descriptors are actually
    // usable, not merely openable.
    Command::new("/bin/sh")
        .args(["-c", "exec true"])
        .stdin(Stdio::from(input))
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn probe_tty() -> bool {
    false
}

#[cfg(unix)]
fn probe_pty() -> bool {
    use portable_pty::{PtySize, native_pty_system};

    native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .is_ok()
}

#[cfg(not(unix))]
fn probe_pty() -> bool {
    false
}

fn probe_shell() -> Option<&'static str> {
    #[cfg(unix)]
    {
        if std::path::Path::new("/bin/sh").exists() {
            None
        } else {
            Some("/bin/sh")
        }
    }
    #[cfg(windows)]
    {
        let comspec = std::env::var_os("ComSpec");
        let found = comspec
            .map(|p| std::path::Path::new(&p).exists())
            .unwrap_or(false);
        if found { None } else { Some("cmd.exe") }
    }
}

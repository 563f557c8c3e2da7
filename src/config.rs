//! Spawn configuration, frozen for the lifetime of a running child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::input::InputSource;

/// How the command is given: a pre-tokenized argument vector, escaped
/// element by element, or a single shell string that may carry
/// `"${:NAME}"` placeholders resolved from the child environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

/// Descriptor layout for the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Anonymous pipes on all three standard streams.
    Piped,
    /// All three streams bound to the controlling terminal. POSIX only.
    Tty,
    /// All three streams on a pseudo-terminal. POSIX only.
    Pty,
    /// Output discarded into the null device; stdin remains a pipe.
    OutputDisabled,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Piped
    }
}

/// Platform-specific spawn flags. Unknown to the core; the strategies
/// interpret what applies to their platform and ignore the rest.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Put the child in its own process group (POSIX).
    #[serde(default)]
    pub process_group: bool,
    /// Do not pop up a console window (Windows).
    #[serde(default)]
    pub create_no_window: bool,
    /// Suppress error dialogs in the child (Windows).
    #[serde(default)]
    pub suppress_errors: bool,
    /// Hand the command line to `CreateProcess` without an extra shell
    /// layer (Windows).
    #[serde(default)]
    pub bypass_shell: bool,
}

/// Terminal status of a supervised child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
    pub signaled: bool,
    pub term_sig: Option<i32>,
    pub running: bool,
}

/// Everything needed to spawn and supervise one child process.
///
/// A `Config` is mutable until the supervisor starts; afterwards the
/// supervisor refuses to hand out mutable access until the child
/// terminates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub(crate) command: CommandSpec,
    #[serde(default)]
    pub(crate) cwd: Option<PathBuf>,
    /// Environment overrides. `None` removes the variable for the child;
    /// everything else is inherited from the parent.
    #[serde(default)]
    pub(crate) env: HashMap<String, Option<String>>,
    #[serde(default, with = "option_duration_millis")]
    pub(crate) timeout: Option<Duration>,
    #[serde(default, with = "option_duration_millis")]
    pub(crate) idle_timeout: Option<Duration>,
    #[serde(default)]
    pub(crate) options: SpawnOptions,
    #[serde(default)]
    pub(crate) mode: Mode,
    #[serde(skip)]
    pub(crate) input: Option<InputSource>,
    /// Overrides the capability oracle's constrained-child answer, so
    /// the sideband exit channel can be forced on or off.
    #[serde(default)]
    pub(crate) force_exit_sideband: Option<bool>,
}

/// Serde helper for `Option<Duration>` as milliseconds.
mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(val: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match val {
            Some(d) => (d.as_millis() as u64).serialize(ser),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let opt: Option<u64> = Option::deserialize(de)?;
        Ok(opt.map(Duration::from_millis))
    }
}

impl Config {
    /// Configuration for a pre-tokenized command.
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandSpec::Argv(argv.into_iter().map(Into::into).collect()))
    }

    /// Configuration for a shell command string, optionally carrying
    /// `"${:NAME}"` placeholders.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(CommandSpec::Shell(command.into()))
    }

    fn new(command: CommandSpec) -> Self {
        Config {
            command,
            cwd: None,
            env: HashMap::new(),
            timeout: None,
            idle_timeout: None,
            options: SpawnOptions::default(),
            mode: Mode::Piped,
            input: None,
            force_exit_sideband: None,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), Some(value.into()));
        self
    }

    /// Remove an environment variable from the child's environment.
    pub fn env_remove(mut self, name: impl Into<String>) -> Self {
        self.env.insert(name.into(), None);
        self
    }

    /// Total wall-clock limit. Zero disables the clock.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    /// Limit on the time between two output chunks. Zero disables the
    /// clock.
    pub fn idle_timeout(mut self, limit: Duration) -> Self {
        self.idle_timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    pub fn options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Use `source` as the child's standard input. The handle may be
    /// kept by the caller and appended to while the child runs.
    pub fn input_source(mut self, source: InputSource) -> Self {
        self.input = Some(source);
        self
    }

    /// Feed a single already-known value as the child's standard input.
    pub fn input(self, value: impl crate::input::IntoChunk) -> Result<Self> {
        let source = InputSource::new();
        source.write(value)?;
        source.close();
        Ok(self.input_source(source))
    }

    /// Force the sideband exit channel on or off instead of consulting
    /// the capability oracle.
    pub fn force_exit_sideband(mut self, enabled: bool) -> Self {
        self.force_exit_sideband = Some(enabled);
        self
    }

    /// Reject mode combinations the platform cannot honour. Called once
    /// at spawn.
    pub(crate) fn validate(&self) -> Result<()> {
        let caps = crate::caps::capabilities();
        match self.mode {
            Mode::Tty => {
                if caps.is_windows() {
                    return Err(Error::invalid("TTY mode is not supported on Windows"));
                }
                if !caps.tty_supported() {
                    return Err(Error::runtime(
                        "TTY mode requires /dev/tty support that this host does not provide",
                    ));
                }
            }
            Mode::Pty => {
                if caps.is_windows() {
                    return Err(Error::invalid("PTY mode is not supported on Windows"));
                }
                if !caps.pty_supported() {
                    return Err(Error::runtime(
                        "PTY mode requires pseudo-terminal support that this host does not provide",
                    ));
                }
            }
            Mode::OutputDisabled => {
                if self.idle_timeout.is_some() {
                    return Err(Error::logic(
                        "an idle timeout cannot be enforced while the output is disabled",
                    ));
                }
            }
            Mode::Piped => {}
        }
        if let Some(missing) = caps.missing_spawn_primitive() {
            return Err(Error::runtime(format!(
                "required spawn primitive is missing: {missing}"
            )));
        }
        Ok(())
    }

    /// The environment the child will observe: the parent environment
    /// with the overrides applied and the removals dropped.
    pub(crate) fn resolved_env(&self) -> HashMap<String, String> {
        let mut resolved: HashMap<String, String> = std::env::vars().collect();
        for (name, value) in &self.env {
            match value {
                Some(v) => {
                    resolved.insert(name.clone(), v.clone());
                }
                None => {
                    resolved.remove(name);
                }
            }
        }
        resolved
    }

    pub(crate) fn output_enabled(&self) -> bool {
        self.mode != Mode::OutputDisabled
    }

    pub(crate) fn sideband_requested(&self) -> bool {
        if cfg!(windows) {
            return false;
        }
        self.force_exit_sideband
            .unwrap_or_else(|| crate::caps::capabilities().constrained_child())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_durations_disable_the_clocks() {
        let config = Config::shell("true")
            .timeout(Duration::ZERO)
            .idle_timeout(Duration::ZERO);
        assert_eq!(config.timeout, None);
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn disabled_output_rejects_idle_timeout() {
        let config = Config::shell("true")
            .mode(Mode::OutputDisabled)
            .idle_timeout(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Logic(_))));
    }

    #[test]
    fn env_overrides_and_removals_resolve() {
        let config = Config::shell("true")
            .env("PROCMUX_TEST_SET", "yes")
            .env_remove("PROCMUX_TEST_UNSET");
        let resolved = config.resolved_env();
        assert_eq!(resolved.get("PROCMUX_TEST_SET").map(String::as_str), Some("yes"));
        assert!(!resolved.contains_key("PROCMUX_TEST_UNSET"));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = Config::argv(["echo", "hi"])
            .timeout(Duration::from_millis(1500))
            .mode(Mode::Piped);
        let json = serde_json::to_string(&config).expect("serialize config");
        let back: Config = serde_json::from_str(&json).expect("deserialize config");
        assert_eq!(back.timeout, Some(Duration::from_millis(1500)));
        assert!(matches!(back.command, CommandSpec::Argv(ref v) if v.len() == 2));
    }
}

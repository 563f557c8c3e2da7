use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the supervision engine.
///
/// Each variant is a distinct kind so callers can discriminate between
/// misuse (`InvalidArgument`, `Logic`), environmental failure (`Runtime`)
/// and clock expiry (`Timeout`, `IdleTimeout`).
#[derive(Debug, Error)]
pub enum Error {
    /// An input value the engine cannot work with (unsupported chunk
    /// type, missing placeholder value, unsupported mode for the
    /// platform).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation that is illegal for the current state, e.g. waiting
    /// on a child that was never started or reading disabled output.
    #[error("{0}")]
    Logic(String),

    /// Spawn, pipe, or signal-delivery failure.
    #[error("{message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The total wall-clock limit elapsed. The child has been killed.
    #[error("the process exceeded the timeout of {limit:?}")]
    Timeout { limit: Duration },

    /// The idle limit elapsed without any output. The child has been
    /// killed.
    #[error("the process produced no output for {limit:?}")]
    IdleTimeout { limit: Duration },
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn logic(message: impl Into<String>) -> Self {
        Error::Logic(message.into())
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn runtime_io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Runtime {
            message: message.into(),
            source: Some(source),
        }
    }

    /// True for either of the two clock-expiry kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::IdleTimeout { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Runtime {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// SPDX-License-Identifier: MIT

//! Engine error kinds.

use std::fmt;

/// Errors produced by the logging engine.
#[derive(Debug)]
pub enum Error {
    /// A record was too large to fit in a fresh page, or a reservation
    /// would overflow the slot-count / payload-size bit widths.
    CapacityExceeded(String),

    /// Configuration is missing a required field or holds an invalid value.
    ConfigInvalid(String),

    /// A file-system or fsync operation failed.
    IoFailure(std::io::Error),

    /// A second transaction context was created on a thread that already
    /// has an active one, or `System::init` was called twice.
    AlreadyInitialized(String),

    /// `log()` or `commit()` was called on a context that already
    /// committed or aborted.
    InactiveContext(String),

    /// The waiter was woken by a shutdown rather than by the condition it
    /// was waiting for; callers must treat this as an abort.
    Shutdown,

    /// The block index (or its underlying store) reported an error.
    IndexFailure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded(msg) => write!(f, "capacity exceeded: {msg}"),
            Self::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Self::IoFailure(err) => write!(f, "I/O failure: {err}"),
            Self::AlreadyInitialized(msg) => write!(f, "already initialized: {msg}"),
            Self::InactiveContext(msg) => write!(f, "inactive context: {msg}"),
            Self::Shutdown => write!(f, "operation aborted by shutdown"),
            Self::IndexFailure(msg) => write!(f, "block index failure: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoFailure(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::IndexFailure(err.to_string())
    }
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the Parade engine.
//!
//! Every backend reports failures through the same [`Error`] enum so the
//! command queue can classify them without knowing which backend produced
//! them.

use thiserror::Error;

/// All possible errors from the Parade engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Addressing errors
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("reference item not found: {0}")]
    ReferenceItemNotFound(String),

    // Remote classification
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid session")]
    InvalidSession,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("missing rights: {0}")]
    MissingRights(String),

    // Transient errors
    #[error("no connection: {0}")]
    NoConnection(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("remote operation timed out after {0} ms")]
    Timeout(u64),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    // Local persistence errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

/// How the command queue treats a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Keep the command at the head of the queue and retry later.
    Transient,
    /// Discard the command and continue with the next one.
    Terminal,
}

impl Error {
    /// Classify this error for the retry/discard policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NoConnection(_) | Error::InternalError(_) | Error::Timeout(_) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Terminal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

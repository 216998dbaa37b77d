//! Common error types for TDM

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for TDM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the persistence layer
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structured payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A file exists but its contents could not be decoded
    #[error("Decode error for {path:?}: {reason}")]
    Decode {
        /// File that failed to decode
        path: PathBuf,
        /// What the decoder rejected
        reason: String,
    },

    /// The task running an operation was aborted before it finished
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The I/O pool has been shut down
    #[error("Persistence layer is shut down")]
    ShutDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a decode error for `path`
    pub fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

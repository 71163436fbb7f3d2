//! Common error types for driftsync.

use thiserror::Error;

/// Top-level error type for driftsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Pulling data from the remote source failed.
    #[error("Pull failed: {0}")]
    Pull(String),

    /// Pushing a changeset to the remote source failed.
    #[error("Push failed: {0}")]
    Push(String),

    /// Loading or saving an internal ledger failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Operation attempted after the engine was disposed.
    #[error("Engine is disposed")]
    Disposed,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

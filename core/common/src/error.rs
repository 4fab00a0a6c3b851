//! Common error types for FFLocker.

use thiserror::Error;

/// Top-level error type for FFLocker operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The key derivation primitive failed.
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    /// Bad magic, unsupported version or truncated header.
    #[error("Format error: {0}")]
    Format(String),

    /// AEAD tag mismatch: wrong key or tampered data.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Footer or length mismatch in a container body.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The file is held exclusively by another process.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// The operation was cancelled and rolled back.
    #[error("Operation cancelled")]
    Cancelled,

    /// Delete or rename was denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A per-file failure rolled back the whole batch.
    #[error("{failed} of {total} files failed, batch rolled back: {source}")]
    Aggregate {
        failed: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Secret storage accessed after it was released.
    #[error("Invalid state: {0}")]
    State(String),

    /// A blocking worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Worker(String),

    /// Locked-items registry failure.
    #[error("Registry error: {0}")]
    Registry(String),
}

impl Error {
    /// The per-file cause behind an aggregate failure, or `self`.
    pub fn root(&self) -> &Error {
        match self {
            Error::Aggregate { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error means the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

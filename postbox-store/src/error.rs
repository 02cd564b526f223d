//! Error types for the postbox-store crate.

use std::io;

use thiserror::Error;

/// Errors from the directory, message and attachment stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record or object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record with the same unique key already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// I/O operation failed (file read/write/rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding a stored record failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store has reached its configured capacity.
    #[error("Store capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A storage key was rejected, e.g. it contained `..`.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns `true` when retrying the whole operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::CapacityExceeded(_) | Self::Internal(_)
        )
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

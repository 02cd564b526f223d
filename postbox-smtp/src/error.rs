//! Error types for the postbox-smtp server side.

use std::io;

use thiserror::Error;

/// Errors that can occur while reading from or writing to a client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line exceeded the permitted length. The rest of it has been
    /// consumed, so the stream is still positioned at the next line.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Response formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

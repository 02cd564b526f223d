//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered with a 4xx or 5xx reply.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// The reply code, when the server produced one
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::SmtpError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

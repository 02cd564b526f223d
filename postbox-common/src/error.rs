//! Error types for the postbox-common crate.
//!
//! These are the foundational errors shared by the listener and the
//! session handlers.

use std::io;

use thiserror::Error;

/// Errors that can occur during session handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Protocol error occurred during session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error occurred.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Session was cancelled (e.g., client disconnected).
    #[error("Session cancelled")]
    Cancelled,

    /// Shutdown signal received.
    #[error("Shutdown requested")]
    Shutdown,

    /// Session timed out.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error indicates a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Cancelled)
    }

    /// Returns `true` if the error is a client-side issue.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Timeout(_))
    }
}

/// Errors that can occur in the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to socket address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        let err = SessionError::Timeout(300);
        assert_eq!(err.to_string(), "Session timed out after 300 seconds");

        let err = SessionError::Protocol("bad command".to_string());
        assert_eq!(err.to_string(), "Protocol error: bad command");
    }

    #[test]
    fn session_error_classification() {
        assert!(SessionError::Shutdown.is_shutdown());
        assert!(SessionError::Cancelled.is_shutdown());
        assert!(!SessionError::Timeout(5).is_shutdown());

        assert!(SessionError::Timeout(5).is_client_error());
        assert!(SessionError::Protocol(String::new()).is_client_error());
        assert!(!SessionError::Connection(io::Error::other("reset")).is_client_error());
    }

    #[test]
    fn listener_error_display() {
        let err = ListenerError::BindFailed {
            address: "0.0.0.0:2525".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:2525"));
    }
}

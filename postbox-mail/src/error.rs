//! Typed errors for the mail service and the outbound relay.
//!
//! [`RelayError`] classifies a failed relay attempt for operators. None of
//! it reaches the original SMTP sender.

use postbox_common::{address::AddressError, model::StatusTransitionError};
use postbox_smtp::client::ClientError;
use postbox_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("A sender address is required")]
    MissingSender,

    #[error("A recipient address is required")]
    MissingRecipient,

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("Mail not found: {0}")]
    MessageNotFound(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    #[error(transparent)]
    Status(#[from] StatusTransitionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Relay failed: {0}")]
    Relay(#[from] RelayError),
}

impl MailError {
    /// Returns `true` when repeating the same call cannot succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Returns `true` for infrastructure failures worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Relay(err) => err.is_connection(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay refused our credentials
    #[error("Relay authentication failed: {0}")]
    Auth(String),

    /// The relay could not be reached, or the conversation broke off
    #[error("Relay connection failed: {0}")]
    Connection(String),

    #[error("Relay rejected the message: {code} {message}")]
    Rejected { code: u16, message: String },

    #[error("Relay configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Classify a failure during AUTH: any reply the server gave is a
    /// credentials problem, anything else is the connection.
    #[must_use]
    pub fn from_auth(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } => Self::Auth(format!("{code} {message}")),
            other => other.into(),
        }
    }
}

impl From<ClientError> for RelayError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } => Self::Rejected { code, message },
            ClientError::TlsError(msg) => Self::Connection(format!("TLS: {msg}")),
            ClientError::ParseError(msg) => {
                Self::Connection(format!("SMTP protocol parse error: {msg}"))
            }
            other => Self::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn client_errors_are_classified() {
        let rejected: RelayError = ClientError::SmtpError {
            code: 550,
            message: "5.7.1 Relaying denied".to_string(),
        }
        .into();
        assert!(rejected.is_rejected());
        assert!(rejected.to_string().contains("550"));

        let connection: RelayError =
            ClientError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")).into();
        assert!(connection.is_connection());

        let closed: RelayError = ClientError::ConnectionClosed.into();
        assert!(closed.is_connection());
    }

    #[test]
    fn auth_replies_are_auth_failures() {
        let auth = RelayError::from_auth(ClientError::SmtpError {
            code: 535,
            message: "5.7.8 bad credentials".to_string(),
        });
        assert!(auth.is_auth());

        let dropped = RelayError::from_auth(ClientError::ConnectionClosed);
        assert!(dropped.is_connection());
    }

    #[test]
    fn mail_error_permanence() {
        assert!(MailError::MissingSender.is_permanent());
        assert!(MailError::MailboxNotFound("a@x.me".to_string()).is_permanent());
        assert!(
            MailError::Store(StoreError::Io(io::Error::other("disk"))).is_transient()
        );
        assert!(
            MailError::Relay(RelayError::Connection("refused".to_string())).is_transient()
        );
        assert!(
            MailError::Relay(RelayError::Auth("535".to_string())).is_permanent()
        );
    }
}

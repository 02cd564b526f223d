//! Stored entities: mailboxes, accounts, messages, attachments and domains.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

/// Subject stored when a message has none
pub const NO_SUBJECT: &str = "(No Subject)";

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique id
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new())
            }

            #[must_use]
            pub const fn ulid(&self) -> ulid::Ulid {
                self.0
            }

            /// Parse the canonical 26 character form
            pub fn parse(value: &str) -> Option<Self> {
                ulid::Ulid::from_string(value).ok().map(Self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Internal identifier of a stored [`Message`]
    MessageId
);
ulid_id!(
    /// Internal identifier of a [`Mailbox`]
    MailboxId
);
ulid_id!(
    /// Internal identifier of an [`Account`]
    AccountId
);

/// An account that may authenticate over SMTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub address: Address,
    /// Argon2 PHC string
    pub password_hash: String,
}

/// A named inbox belonging to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub address: Address,
    pub account_id: AccountId,
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Draft,
    Sent,
    Received,
    Failed,
}

impl MessageStatus {
    /// Only a draft may move, and only to `Sent` or `Failed`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Sent | Self::Failed)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Draft)
    }
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Message status cannot change from {from} to {to}")]
pub struct StatusTransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// Attachment metadata embedded in a [`Message`].
///
/// The bytes live in the attachment store; `storage_key` and `locator` are
/// `None` when the upload failed, in which case `error` says why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub storage_key: Option<String>,
    pub locator: Option<String>,
    pub error: Option<String>,
}

impl Attachment {
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        self.storage_key.is_some() && self.locator.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub mailbox_id: MailboxId,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
    pub status: MessageStatus,
    /// Protocol `Message-ID`, unique when present
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Move this message to `next`, enforcing the status state machine.
    pub fn transition(&mut self, next: MessageStatus) -> Result<(), StatusTransitionError> {
        if self.status.can_transition_to(next) {
            self.status = next;
            Ok(())
        } else {
            Err(StatusTransitionError {
                from: self.status,
                to: next,
            })
        }
    }
}

/// A mail domain and the result of its last MX lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub mx_record: Option<String>,
    /// Derived solely from `mx_record.is_some()`
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Domain {
    #[must_use]
    pub fn new(name: &str, mx_record: Option<String>) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            verified: mx_record.is_some(),
            mx_record,
            created_at: Utc::now(),
        }
    }
}

use std::fmt::Debug;

use async_trait::async_trait;
use postbox_common::{
    address::Address,
    model::{Account, AccountId, Domain, Mailbox, MailboxId, Message, MessageId},
};
use serde::{Deserialize, Serialize};

use crate::{Result, credentials};

/// Address to mailbox lookup, shared read-mostly by every session.
///
/// Addresses are compared after [`postbox_common::address::normalize`], so
/// lookups are case-insensitive and ignore surrounding whitespace.
#[async_trait]
pub trait MailboxDirectory: Send + Sync + Debug {
    /// Find the mailbox owning `address`
    async fn find(&self, address: &str) -> Result<Option<Mailbox>>;

    async fn find_by_id(&self, id: MailboxId) -> Result<Option<Mailbox>>;

    /// Create a mailbox for `address`.
    ///
    /// # Errors
    /// [`crate::StoreError::AlreadyExists`] if the address already has one
    async fn register(
        &self,
        address: &Address,
        account_id: AccountId,
        domain: Option<String>,
    ) -> Result<Mailbox>;
}

/// Accounts that may authenticate over SMTP.
#[async_trait]
pub trait AccountDirectory: Send + Sync + Debug {
    async fn find_account(&self, address: &str) -> Result<Option<Account>>;

    /// # Errors
    /// [`crate::StoreError::AlreadyExists`] if the address is taken
    async fn insert_account(&self, account: Account) -> Result<Account>;

    /// Verify `password` for `username`.
    ///
    /// An unknown user and a wrong password both give `Ok(None)`, and both
    /// cost one password verification.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Account>> {
        match self.find_account(username).await? {
            Some(account) if credentials::verify_password(password, &account.password_hash) => {
                Ok(Some(account))
            }
            Some(_) => Ok(None),
            None => {
                credentials::verify_dummy(password);
                Ok(None)
            }
        }
    }
}

/// Result of [`MessageStore::insert_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Message),
    /// A message with the same protocol message-id was already stored
    Existing(Message),
}

impl InsertOutcome {
    #[must_use]
    pub const fn message(&self) -> &Message {
        match self {
            Self::Inserted(message) | Self::Existing(message) => message,
        }
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        match self {
            Self::Inserted(message) | Self::Existing(message) => message,
        }
    }

    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Persistence for [`Message`] documents.
///
/// Each message is written and replaced as a whole.
#[async_trait]
pub trait MessageStore: Send + Sync + Debug {
    /// Store a new message.
    ///
    /// # Errors
    /// [`crate::StoreError::AlreadyExists`] if the id or protocol message-id
    /// is already present
    async fn insert(&self, message: Message) -> Result<Message>;

    /// Store `message` unless one with the same protocol message-id exists,
    /// in which case the stored one is returned untouched.
    ///
    /// Messages without a message-id are always inserted.
    async fn insert_if_absent(&self, message: Message) -> Result<InsertOutcome>;

    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// Replace a stored message.
    ///
    /// # Errors
    /// [`crate::StoreError::NotFound`] if it was never inserted
    async fn update(&self, message: &Message) -> Result<()>;

    /// Messages owned by `mailbox`, newest first
    async fn list_by_mailbox(
        &self,
        mailbox: MailboxId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    async fn all(&self) -> Result<Vec<Message>>;
}

/// Where an attachment's bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub key: String,
    /// URL the bytes can be fetched from
    pub locator: String,
    pub size: u64,
    pub content_type: String,
    pub filename: String,
}

/// Blob storage for attachment bytes, keyed by message.
#[async_trait]
pub trait AttachmentStore: Send + Sync + Debug {
    async fn put(
        &self,
        message_id: MessageId,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<StoredAttachment>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove every attachment stored for `message_id`, returning how many
    async fn delete_for_message(&self, message_id: MessageId) -> Result<usize>;
}

/// Known mail domains and their MX state.
#[async_trait]
pub trait DomainRegistry: Send + Sync + Debug {
    /// # Errors
    /// [`crate::StoreError::AlreadyExists`] on a duplicate name
    async fn insert_domain(&self, domain: Domain) -> Result<Domain>;

    async fn find_domain(&self, name: &str) -> Result<Option<Domain>>;

    async fn update_domain(&self, domain: &Domain) -> Result<()>;

    /// All domains, ordered by name
    async fn all_domains(&self) -> Result<Vec<Domain>>;
}

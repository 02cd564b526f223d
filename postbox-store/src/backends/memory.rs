use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use postbox_common::{
    address::{self, Address},
    model::{Account, AccountId, Domain, Mailbox, MailboxId, Message, MessageId},
};

use crate::{
    StoreError, key,
    r#trait::{
        AccountDirectory, AttachmentStore, DomainRegistry, InsertOutcome, MailboxDirectory,
        MessageStore, StoredAttachment,
    },
};

/// In-memory mailbox and account directory.
///
/// Mailboxes are keyed by normalised address with a secondary index by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    mailboxes: Arc<DashMap<String, Mailbox>>,
    mailbox_ids: Arc<DashMap<MailboxId, String>>,
    accounts: Arc<DashMap<String, Account>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered mailboxes
    #[must_use]
    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

#[async_trait]
impl MailboxDirectory for MemoryDirectory {
    async fn find(&self, address: &str) -> crate::Result<Option<Mailbox>> {
        Ok(self
            .mailboxes
            .get(&address::normalize(address))
            .map(|mailbox| mailbox.clone()))
    }

    async fn find_by_id(&self, id: MailboxId) -> crate::Result<Option<Mailbox>> {
        let Some(address) = self.mailbox_ids.get(&id).map(|address| address.clone()) else {
            return Ok(None);
        };

        Ok(self.mailboxes.get(&address).map(|mailbox| mailbox.clone()))
    }

    async fn register(
        &self,
        address: &Address,
        account_id: AccountId,
        domain: Option<String>,
    ) -> crate::Result<Mailbox> {
        match self.mailboxes.entry(address.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(address.to_string())),
            Entry::Vacant(vacant) => {
                let mailbox = Mailbox {
                    id: MailboxId::generate(),
                    address: address.clone(),
                    account_id,
                    domain,
                    created_at: Utc::now(),
                };
                self.mailbox_ids.insert(mailbox.id, address.to_string());
                vacant.insert(mailbox.clone());
                Ok(mailbox)
            }
        }
    }
}

#[async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn find_account(&self, address: &str) -> crate::Result<Option<Account>> {
        Ok(self
            .accounts
            .get(&address::normalize(address))
            .map(|account| account.clone()))
    }

    async fn insert_account(&self, account: Account) -> crate::Result<Account> {
        match self.accounts.entry(account.address.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(account.address.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(account.clone());
                Ok(account)
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Messages {
    pub(crate) by_id: HashMap<MessageId, Message>,
    by_message_id: HashMap<String, MessageId>,
}

impl Messages {
    pub(crate) fn insert(&mut self, message: Message) {
        if let Some(message_id) = &message.message_id {
            self.by_message_id.insert(message_id.clone(), message.id);
        }
        self.by_id.insert(message.id, message);
    }

    pub(crate) fn existing(&self, message: &Message) -> Option<&Message> {
        message
            .message_id
            .as_ref()
            .and_then(|message_id| self.by_message_id.get(message_id))
            .and_then(|id| self.by_id.get(id))
    }

    pub(crate) fn newest_first<'a>(
        messages: impl Iterator<Item = &'a Message>,
        limit: usize,
        offset: usize,
    ) -> Vec<Message> {
        let mut matched: Vec<&Message> = messages.collect();
        // Ids are ULIDs, so they break ties between equal timestamps in
        // creation order.
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// In-memory message store
///
/// Messages live in a `HashMap` behind an `RwLock`, with a second map from
/// protocol message-id to internal id so that duplicate detection and the
/// insert happen under one write lock.
///
/// # Capacity Management
/// An optional capacity bounds memory use; inserts beyond it fail with
/// [`StoreError::CapacityExceeded`].
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageStore {
    pub(crate) messages: Arc<RwLock<Messages>>,
    capacity: Option<usize>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_id
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn check_capacity(&self, messages: &Messages) -> crate::Result<()> {
        if let Some(cap) = self.capacity
            && messages.by_id.len() >= cap
        {
            return Err(StoreError::CapacityExceeded(format!(
                "Memory store capacity exceeded: {}/{cap} messages",
                messages.by_id.len()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: Message) -> crate::Result<Message> {
        let mut messages = self.messages.write()?;

        if messages.by_id.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id.to_string()));
        }
        if let Some(existing) = messages.existing(&message) {
            return Err(StoreError::AlreadyExists(
                existing.message_id.clone().unwrap_or_default(),
            ));
        }
        self.check_capacity(&messages)?;

        messages.insert(message.clone());
        Ok(message)
    }

    async fn insert_if_absent(&self, message: Message) -> crate::Result<InsertOutcome> {
        let mut messages = self.messages.write()?;

        if let Some(existing) = messages.existing(&message) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        if messages.by_id.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id.to_string()));
        }
        self.check_capacity(&messages)?;

        messages.insert(message.clone());
        Ok(InsertOutcome::Inserted(message))
    }

    async fn get(&self, id: MessageId) -> crate::Result<Option<Message>> {
        Ok(self.messages.read()?.by_id.get(&id).cloned())
    }

    async fn update(&self, message: &Message) -> crate::Result<()> {
        let mut messages = self.messages.write()?;
        if !messages.by_id.contains_key(&message.id) {
            return Err(StoreError::NotFound(message.id.to_string()));
        }

        messages.insert(message.clone());
        Ok(())
    }

    async fn list_by_mailbox(
        &self,
        mailbox: MailboxId,
        limit: usize,
        offset: usize,
    ) -> crate::Result<Vec<Message>> {
        let messages = self.messages.read()?;
        Ok(Messages::newest_first(
            messages.by_id.values().filter(|m| m.mailbox_id == mailbox),
            limit,
            offset,
        ))
    }

    async fn all(&self) -> crate::Result<Vec<Message>> {
        let messages = self.messages.read()?;
        Ok(Messages::newest_first(
            messages.by_id.values(),
            usize::MAX,
            0,
        ))
    }
}

/// In-memory attachment store. Locators use the `memory://` scheme.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttachmentStore {
    objects: Arc<DashMap<String, Arc<[u8]>>>,
}

impl MemoryAttachmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drop an object, simulating loss in the backing service
    pub fn remove(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn put(
        &self,
        message_id: MessageId,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> crate::Result<StoredAttachment> {
        let key = key::attachment_key(message_id, filename);
        self.objects.insert(key.clone(), Arc::from(bytes));

        Ok(StoredAttachment {
            locator: format!("memory://{key}"),
            key,
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            filename: filename.to_string(),
        })
    }

    async fn get(&self, key: &str) -> crate::Result<Vec<u8>> {
        key::validate(key)?;
        self.objects
            .get(key)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete_for_message(&self, message_id: MessageId) -> crate::Result<usize> {
        let prefix = key::message_prefix(message_id);
        let before = self.objects.len();
        self.objects.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - self.objects.len())
    }
}

/// In-memory domain registry
#[derive(Debug, Clone, Default)]
pub struct MemoryDomainRegistry {
    domains: Arc<DashMap<String, Domain>>,
}

impl MemoryDomainRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DomainRegistry for MemoryDomainRegistry {
    async fn insert_domain(&self, domain: Domain) -> crate::Result<Domain> {
        match self.domains.entry(domain.name.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(domain.name)),
            Entry::Vacant(vacant) => {
                vacant.insert(domain.clone());
                Ok(domain)
            }
        }
    }

    async fn find_domain(&self, name: &str) -> crate::Result<Option<Domain>> {
        Ok(self
            .domains
            .get(&name.trim().to_lowercase())
            .map(|domain| domain.clone()))
    }

    async fn update_domain(&self, domain: &Domain) -> crate::Result<()> {
        self.domains
            .get_mut(&domain.name)
            .map(|mut stored| *stored = domain.clone())
            .ok_or_else(|| StoreError::NotFound(domain.name.clone()))
    }

    async fn all_domains(&self) -> crate::Result<Vec<Domain>> {
        let mut domains: Vec<Domain> = self.domains.iter().map(|d| d.value().clone()).collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use postbox_common::model::{MessageStatus, NO_SUBJECT};
    use pretty_assertions::assert_eq;

    use super::*;

    fn message(mailbox: MailboxId, message_id: Option<&str>) -> Message {
        Message {
            id: MessageId::generate(),
            mailbox_id: mailbox,
            from: "ext@external.com".to_string(),
            to: "user@authoritative.tld".to_string(),
            subject: NO_SUBJECT.to_string(),
            text: "hello".to_string(),
            html: String::new(),
            attachments: Vec::new(),
            status: MessageStatus::Received,
            message_id: message_id.map(ToString::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn directory_lookup_is_case_insensitive() {
        let directory = MemoryDirectory::new();
        let address = Address::parse("User@Authoritative.tld").unwrap();
        let mailbox = directory
            .register(&address, AccountId::generate(), None)
            .await
            .unwrap();

        let found = directory.find("  USER@authoritative.TLD ").await.unwrap();
        assert_eq!(found.as_ref(), Some(&mailbox));
        assert_eq!(
            directory.find_by_id(mailbox.id).await.unwrap(),
            Some(mailbox)
        );
        assert!(directory.find("other@authoritative.tld").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let directory = MemoryDirectory::new();
        let address = Address::parse("user@authoritative.tld").unwrap();
        directory
            .register(&address, AccountId::generate(), None)
            .await
            .unwrap();

        let result = directory
            .register(&address, AccountId::generate(), None)
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn authenticate_is_generic() {
        let directory = MemoryDirectory::new();
        directory
            .insert_account(Account {
                id: AccountId::generate(),
                address: Address::parse("user@authoritative.tld").unwrap(),
                password_hash: crate::credentials::hash_password("secret").unwrap(),
            })
            .await
            .unwrap();

        assert!(
            directory
                .authenticate("USER@authoritative.tld", "secret")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            directory
                .authenticate("user@authoritative.tld", "wrong")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            directory
                .authenticate("nobody@authoritative.tld", "secret")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn insert_if_absent_returns_existing() {
        let store = MemoryMessageStore::new();
        let mailbox = MailboxId::generate();

        let first = store
            .insert_if_absent(message(mailbox, Some("<abc@external.com>")))
            .await
            .unwrap();
        assert!(first.is_inserted());

        let second = store
            .insert_if_absent(message(mailbox, Some("<abc@external.com>")))
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::Existing(first.into_message()));
        assert_eq!(store.len(), 1);

        // Messages without a message-id are never deduplicated
        store.insert_if_absent(message(mailbox, None)).await.unwrap();
        store.insert_if_absent(message(mailbox, None)).await.unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_message_id() {
        let store = MemoryMessageStore::new();
        let mailbox = MailboxId::generate();
        store
            .insert(message(mailbox, Some("<dup@x.me>")))
            .await
            .unwrap();

        let result = store.insert(message(mailbox, Some("<dup@x.me>"))).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn list_by_mailbox_is_newest_first_and_paged() {
        let store = MemoryMessageStore::new();
        let mailbox = MailboxId::generate();
        let now = Utc::now();

        let mut ids = Vec::new();
        for age in [3, 1, 2] {
            let mut msg = message(mailbox, None);
            msg.created_at = now - Duration::minutes(age);
            ids.push((age, msg.id));
            store.insert(msg).await.unwrap();
        }
        store
            .insert(message(MailboxId::generate(), None))
            .await
            .unwrap();

        let listed = store.list_by_mailbox(mailbox, 50, 0).await.unwrap();
        let ages: Vec<i64> = listed
            .iter()
            .map(|m| ids.iter().find(|(_, id)| *id == m.id).unwrap().0)
            .collect();
        assert_eq!(ages, vec![1, 2, 3]);

        let page = store.list_by_mailbox(mailbox, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, listed[1].id);

        assert_eq!(store.all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn update_requires_existing_message() {
        let store = MemoryMessageStore::new();
        let mut msg = message(MailboxId::generate(), None);
        assert!(matches!(
            store.update(&msg).await,
            Err(StoreError::NotFound(_))
        ));

        store.insert(msg.clone()).await.unwrap();
        msg.subject = "Updated".to_string();
        store.update(&msg).await.unwrap();
        assert_eq!(store.get(msg.id).await.unwrap().unwrap().subject, "Updated");
    }

    #[tokio::test]
    async fn capacity_limit() {
        let store = MemoryMessageStore::with_capacity(1);
        store
            .insert(message(MailboxId::generate(), None))
            .await
            .unwrap();

        let result = store.insert(message(MailboxId::generate(), None)).await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("capacity exceeded"));
    }

    #[tokio::test]
    async fn attachments_round_trip_and_delete_by_message() {
        let store = MemoryAttachmentStore::new();
        let id = MessageId::generate();
        let other = MessageId::generate();

        let stored = store
            .put(id, b"hello world", "notes.txt", "text/plain")
            .await
            .unwrap();
        store.put(id, b"%PDF", "a.pdf", "application/pdf").await.unwrap();
        store.put(other, b"x", "x.bin", "application/octet-stream").await.unwrap();

        assert_eq!(stored.size, 11);
        assert!(stored.locator.starts_with("memory://mails/"));
        assert_eq!(store.get(&stored.key).await.unwrap(), b"hello world".to_vec());

        assert_eq!(store.delete_for_message(id).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.get(&stored.key).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn domains_are_unique_and_sorted() {
        let registry = MemoryDomainRegistry::new();
        registry
            .insert_domain(Domain::new("zeta.test", None))
            .await
            .unwrap();
        registry
            .insert_domain(Domain::new("alpha.test", Some("mx.alpha.test".to_string())))
            .await
            .unwrap();

        assert!(matches!(
            registry.insert_domain(Domain::new("ZETA.test", None)).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let names: Vec<String> = registry
            .all_domains()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha.test", "zeta.test"]);

        let mut zeta = registry.find_domain("Zeta.Test").await.unwrap().unwrap();
        zeta.mx_record = Some("mx.zeta.test".to_string());
        zeta.verified = true;
        registry.update_domain(&zeta).await.unwrap();
        assert!(registry.find_domain("zeta.test").await.unwrap().unwrap().verified);
    }
}

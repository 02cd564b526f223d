use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use postbox_common::{
    internal,
    model::{MailboxId, Message, MessageId},
};
use serde::Deserialize;
use tokio::{fs, sync::Mutex};

use super::memory::Messages;
use crate::{
    StoreError, key,
    r#trait::{AttachmentStore, InsertOutcome, MessageStore, StoredAttachment},
};

const TMP_PREFIX: &str = ".tmp_";

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn validate_root(path: &Path) -> crate::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::InvalidKey("storage path is empty".to_string()));
    }

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(StoreError::InvalidKey(format!(
            "storage path cannot contain '..' components: {}",
            path.display()
        )));
    }

    Ok(())
}

fn ensure_directory(path: &Path) -> crate::Result<()> {
    if !path.try_exists()? {
        internal!("{} does not exist, creating...", path.display());
        std::fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(StoreError::Io(std::io::Error::new(
            ErrorKind::NotADirectory,
            format!("Expected {} to be a Directory, but it is not", path.display()),
        )));
    }

    Ok(())
}

/// Write `bytes` to `path` through a temporary sibling and a rename, so a
/// crash never leaves a partially written file under the final name.
async fn write_atomic(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?
        .to_string_lossy();
    let temp = path.with_file_name(format!("{TMP_PREFIX}{file_name}"));

    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await?;
    Ok(())
}

/// File-based message store
///
/// Each message is one bincode file, `{id}.bin`, under the configured
/// directory. All messages are indexed in memory by [`FileMessageStore::init`]
/// so lookups and listings never touch the disk; writes go to disk first and
/// only then to the index.
///
/// Writers are serialised by an async mutex so that duplicate detection in
/// [`MessageStore::insert_if_absent`] and the write are atomic.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    path: PathBuf,
    index: Arc<RwLock<Messages>>,
    writer: Arc<Mutex<()>>,
}

impl Default for FileMessageStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage/messages"),
            index: Arc::default(),
            writer: Arc::default(),
        }
    }
}

impl<'de> Deserialize<'de> for FileMessageStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            path: PathBuf,
        }

        let helper = Helper::deserialize(deserializer)?;
        Self::new(helper.path).map_err(serde::de::Error::custom)
    }
}

impl FileMessageStore {
    /// # Errors
    /// If `path` is empty or contains `..`
    pub fn new(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        validate_root(&path)?;

        Ok(Self {
            path,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if needed, remove leftovers of interrupted
    /// writes and load every stored message into the index.
    ///
    /// # Errors
    /// If the directory cannot be created or read, or a message file is corrupt
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising message store at {} ...", self.path.display());
        ensure_directory(&self.path)?;

        let mut loaded = Messages::default();
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();

            if file_name.starts_with(TMP_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
                continue;
            }

            let Some(id) = file_name
                .strip_suffix(".bin")
                .and_then(MessageId::parse)
            else {
                continue;
            };

            let bytes = std::fs::read(entry.path())?;
            let (message, _): (Message, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode_config())?;

            if message.id != id {
                return Err(StoreError::Serialization(format!(
                    "{file_name} contains message {}",
                    message.id
                )));
            }

            loaded.insert(message);
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} interrupted writes from message store"
            );
        }

        internal!(
            level = INFO,
            "Loaded {} messages from {}",
            loaded.by_id.len(),
            self.path.display()
        );
        *self.index.write()? = loaded;

        Ok(())
    }

    fn message_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    async fn persist(&self, message: &Message) -> crate::Result<()> {
        let bytes = bincode::serde::encode_to_vec(message, bincode_config())?;
        write_atomic(&self.message_path(message.id), &bytes).await
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn insert(&self, message: Message) -> crate::Result<Message> {
        let _writer = self.writer.lock().await;

        {
            let index = self.index.read()?;
            if index.by_id.contains_key(&message.id) {
                return Err(StoreError::AlreadyExists(message.id.to_string()));
            }
            if let Some(existing) = index.existing(&message) {
                return Err(StoreError::AlreadyExists(
                    existing.message_id.clone().unwrap_or_default(),
                ));
            }
        }

        self.persist(&message).await?;
        self.index.write()?.insert(message.clone());
        Ok(message)
    }

    async fn insert_if_absent(&self, message: Message) -> crate::Result<InsertOutcome> {
        let _writer = self.writer.lock().await;

        {
            let index = self.index.read()?;
            if let Some(existing) = index.existing(&message) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            if index.by_id.contains_key(&message.id) {
                return Err(StoreError::AlreadyExists(message.id.to_string()));
            }
        }

        self.persist(&message).await?;
        self.index.write()?.insert(message.clone());
        Ok(InsertOutcome::Inserted(message))
    }

    async fn get(&self, id: MessageId) -> crate::Result<Option<Message>> {
        Ok(self.index.read()?.by_id.get(&id).cloned())
    }

    async fn update(&self, message: &Message) -> crate::Result<()> {
        let _writer = self.writer.lock().await;

        if !self.index.read()?.by_id.contains_key(&message.id) {
            return Err(StoreError::NotFound(message.id.to_string()));
        }

        self.persist(message).await?;
        self.index.write()?.insert(message.clone());
        Ok(())
    }

    async fn list_by_mailbox(
        &self,
        mailbox: MailboxId,
        limit: usize,
        offset: usize,
    ) -> crate::Result<Vec<Message>> {
        let index = self.index.read()?;
        Ok(Messages::newest_first(
            index.by_id.values().filter(|m| m.mailbox_id == mailbox),
            limit,
            offset,
        ))
    }

    async fn all(&self) -> crate::Result<Vec<Message>> {
        let index = self.index.read()?;
        Ok(Messages::newest_first(index.by_id.values(), usize::MAX, 0))
    }
}

/// File-based attachment store
///
/// An attachment key is used directly as a path relative to the storage
/// root. The locator is `{public_url}/{key}` when a public URL is
/// configured, otherwise a `file://` URL to the stored file.
#[derive(Debug, Clone)]
pub struct FileAttachmentStore {
    path: PathBuf,
    public_url: Option<String>,
}

impl Default for FileAttachmentStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./storage/attachments"),
            public_url: None,
        }
    }
}

impl<'de> Deserialize<'de> for FileAttachmentStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper {
            path: PathBuf,
            #[serde(default)]
            public_url: Option<String>,
        }

        let helper = Helper::deserialize(deserializer)?;
        let store = Self::new(helper.path).map_err(serde::de::Error::custom)?;
        Ok(match helper.public_url {
            Some(url) => store.with_public_url(url),
            None => store,
        })
    }
}

impl FileAttachmentStore {
    /// # Errors
    /// If `path` is empty or contains `..`
    pub fn new(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        validate_root(&path)?;

        Ok(Self {
            path,
            public_url: None,
        })
    }

    #[must_use]
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    /// If the storage directory cannot be created
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising attachment store at {} ...", self.path.display());
        ensure_directory(&self.path)
    }

    fn locator(&self, key: &str, path: &Path) -> String {
        match &self.public_url {
            Some(url) => format!("{url}/{key}"),
            None => {
                let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
                format!("file://{}", absolute.display())
            }
        }
    }
}

#[async_trait]
impl AttachmentStore for FileAttachmentStore {
    async fn put(
        &self,
        message_id: MessageId,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> crate::Result<StoredAttachment> {
        let key = key::attachment_key(message_id, filename);
        key::validate(&key)?;

        let path = self.path.join(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, bytes).await?;

        internal!(
            level = DEBUG,
            "Stored attachment {key} ({} bytes)",
            bytes.len()
        );

        Ok(StoredAttachment {
            locator: self.locator(&key, &path),
            key,
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
            filename: filename.to_string(),
        })
    }

    async fn get(&self, key: &str) -> crate::Result<Vec<u8>> {
        key::validate(key)?;

        match fs::read(self.path.join(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_for_message(&self, message_id: MessageId) -> crate::Result<usize> {
        let directory = self.path.join(key::message_prefix(message_id));
        if !fs::try_exists(&directory).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                removed += 1;
            }
        }

        fs::remove_dir_all(&directory).await?;
        Ok(removed)
    }
}

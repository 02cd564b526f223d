use std::sync::Arc;

use serde::Deserialize;

use crate::{
    backends::{FileAttachmentStore, FileMessageStore, MemoryAttachmentStore, MemoryMessageStore},
    r#trait::{AttachmentStore, MessageStore},
};

/// Where message documents are kept
///
/// ```toml
/// [storage]
/// messages = { type = "File", path = "/var/lib/postbox/messages" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum MessageStorageConfig {
    File(FileMessageStore),
    /// Lost on restart
    Memory(MemoryConfig),
}

/// Where attachment bytes are kept
///
/// ```toml
/// [storage]
/// attachments = { type = "File", path = "/var/lib/postbox/attachments", public_url = "https://files.example.com" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AttachmentStorageConfig {
    File(FileAttachmentStore),
    Memory,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of messages to store (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub messages: MessageStorageConfig,
    pub attachments: AttachmentStorageConfig,
}

impl Default for MessageStorageConfig {
    fn default() -> Self {
        Self::File(FileMessageStore::default())
    }
}

impl Default for AttachmentStorageConfig {
    fn default() -> Self {
        Self::File(FileAttachmentStore::default())
    }
}

impl MessageStorageConfig {
    /// Construct and initialise the configured store
    ///
    /// # Errors
    /// If a file-backed store cannot be initialised
    pub fn build(&self) -> crate::Result<Arc<dyn MessageStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store.clone()))
            }
            Self::Memory(config) => Ok(match config.capacity {
                Some(capacity) => Arc::new(MemoryMessageStore::with_capacity(capacity)),
                None => Arc::new(MemoryMessageStore::new()),
            }),
        }
    }
}

impl AttachmentStorageConfig {
    /// Construct and initialise the configured store
    ///
    /// # Errors
    /// If a file-backed store cannot be initialised
    pub fn build(&self) -> crate::Result<Arc<dyn AttachmentStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store.clone()))
            }
            Self::Memory => Ok(Arc::new(MemoryAttachmentStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_backends() {
        let config: StorageConfig = toml::from_str(
            r#"
            messages = { type = "Memory", capacity = 10 }
            attachments = { type = "File", path = "/tmp/postbox", public_url = "https://cdn.example.com" }
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.messages,
            MessageStorageConfig::Memory(MemoryConfig { capacity: Some(10) })
        ));
        let AttachmentStorageConfig::File(store) = config.attachments else {
            panic!("expected a file attachment store");
        };
        assert_eq!(store.path(), std::path::Path::new("/tmp/postbox"));
    }

    #[test]
    fn traversal_paths_fail_to_parse() {
        let result: Result<StorageConfig, _> =
            toml::from_str(r#"messages = { type = "File", path = "../../etc" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn memory_backends_build() {
        let config: StorageConfig = toml::from_str(
            r#"
            messages = { type = "Memory" }
            attachments = { type = "Memory" }
            "#,
        )
        .unwrap();

        assert!(config.messages.build().is_ok());
        assert!(config.attachments.build().is_ok());
    }
}

pub mod backends;
pub mod config;
pub mod credentials;
pub mod error;
pub mod key;
pub mod r#trait;

pub use backends::{
    FileAttachmentStore, FileMessageStore, MemoryAttachmentStore, MemoryDirectory,
    MemoryDomainRegistry, MemoryMessageStore, TestMessageStore,
};
pub use config::{AttachmentStorageConfig, MemoryConfig, MessageStorageConfig, StorageConfig};
pub use error::{Result, StoreError};
pub use r#trait::{
    AccountDirectory, AttachmentStore, DomainRegistry, InsertOutcome, MailboxDirectory,
    MessageStore, StoredAttachment,
};

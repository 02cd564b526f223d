//! Backend storage implementations
//!
//! - `memory`: In-memory directory, message, attachment and domain stores
//! - `file`: File-based message and attachment stores for production use
//! - `test`: Message store wrapper with synchronization primitives for tests

pub mod file;
pub mod memory;

pub use file::{FileAttachmentStore, FileMessageStore};
pub use memory::{MemoryAttachmentStore, MemoryDirectory, MemoryDomainRegistry, MemoryMessageStore};
pub use test::TestMessageStore;

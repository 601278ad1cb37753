//! Storage collaborators for the vault feed service.
//!
//! A feed is an append-only log of opaque entries addressed by a zero-based
//! index. This crate defines the [`FeedStorage`] / [`FeedLog`] traits the
//! session layer is written against, a lazy range reader over any
//! [`FeedLog`], and two backends selected through [`StorageConfig`]:
//!
//! - `InMemory`: entries live only as long as the process.
//! - `File`: one directory per feed under a data directory, named by the
//!   SHA-256 of the feed URI, holding a length-prefixed entry file.

pub mod storage;

pub use storage::config::{FileStorageConfig, StorageConfig};
pub use storage::factory::create_storage;
pub use storage::file::FileFeedStorage;
pub use storage::in_memory::{InMemoryFeedLog, InMemoryFeedStorage};
pub use storage::range::{EntryStream, ReadRange, read_range};
pub use storage::{Entry, FeedLog, FeedStorage, StorageError, StorageResult};

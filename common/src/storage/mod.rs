//! Feed storage traits and shared types.

pub mod config;
pub mod factory;
pub mod file;
pub mod in_memory;
pub mod range;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, watch};

/// Errors returned by feed storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The log was opened read-only (or is owned by another writer).
    #[error("feed is not writable")]
    NotWritable,
    /// The log has been closed and accepts no more operations.
    #[error("feed is closed")]
    Closed,
    /// Backend failure with a human readable description.
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A condition the backend assumes can never happen.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// An entry read back from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Zero-based position of the entry in its feed.
    pub index: u64,
    /// The entry payload, uninterpreted.
    pub value: Bytes,
}

/// Handle to a single open append-only log.
///
/// Appends are serialized by the implementation, so a handle may be shared
/// freely between sessions and connections.
#[async_trait]
pub trait FeedLog: Send + Sync {
    /// Appends an entry and returns the index assigned to it.
    async fn append(&self, value: Bytes) -> StorageResult<u64>;

    /// Reads the entry at `index`, or `None` when the index is past the end.
    async fn get(&self, index: u64) -> StorageResult<Option<Bytes>>;

    /// Number of entries currently in the log.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_writable(&self) -> bool;

    /// Subscribes to length changes. Live readers park on this until an
    /// append moves the length past their position.
    fn watch_len(&self) -> watch::Receiver<u64>;

    /// Flushes and releases the log. Further appends fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> StorageResult<()>;
}

/// Factory for feed logs keyed by URI.
///
/// Opening the same URI twice is not required to return the same handle;
/// callers that need one handle per URI must deduplicate themselves.
#[async_trait]
pub trait FeedStorage: Send + Sync {
    async fn open(&self, uri: &str) -> StorageResult<Arc<dyn FeedLog>>;
}

/// In-process copy of a log's entries plus the length watermark.
///
/// Both backends serve reads from this cache; the file backend additionally
/// persists every entry before it is pushed here.
pub(crate) struct EntryCache {
    entries: RwLock<Vec<Bytes>>,
    len_tx: watch::Sender<u64>,
}

impl EntryCache {
    pub(crate) fn new(entries: Vec<Bytes>) -> Self {
        let (len_tx, _) = watch::channel(entries.len() as u64);
        Self {
            entries: RwLock::new(entries),
            len_tx,
        }
    }

    /// Pushes an entry and publishes the new length. Returns its index.
    pub(crate) async fn push(&self, value: Bytes) -> u64 {
        let mut entries = self.entries.write().await;
        let index = entries.len() as u64;
        entries.push(value);
        self.len_tx.send_replace(index + 1);
        index
    }

    pub(crate) async fn get(&self, index: u64) -> Option<Bytes> {
        let entries = self.entries.read().await;
        usize::try_from(index)
            .ok()
            .and_then(|i| entries.get(i))
            .cloned()
    }

    pub(crate) fn len(&self) -> u64 {
        *self.len_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.len_tx.subscribe()
    }
}

//! In-memory feed storage, used by tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, watch};

use super::{EntryCache, FeedLog, FeedStorage, StorageError, StorageResult};

/// A feed log whose entries live only in memory.
pub struct InMemoryFeedLog {
    cache: EntryCache,
    writable: bool,
    closed: AtomicBool,
}

impl InMemoryFeedLog {
    pub fn new() -> Self {
        Self::with_entries(Vec::new(), true)
    }

    /// Creates a log pre-populated with `entries`. A log built with
    /// `writable = false` rejects every append with
    /// [`StorageError::NotWritable`].
    pub fn with_entries(entries: Vec<Bytes>, writable: bool) -> Self {
        Self {
            cache: EntryCache::new(entries),
            writable,
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryFeedLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedLog for InMemoryFeedLog {
    async fn append(&self, value: Bytes) -> StorageResult<u64> {
        if !self.writable {
            return Err(StorageError::NotWritable);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.cache.push(value).await)
    }

    async fn get(&self, index: u64) -> StorageResult<Option<Bytes>> {
        Ok(self.cache.get(index).await)
    }

    fn len(&self) -> u64 {
        self.cache.len()
    }

    fn is_writable(&self) -> bool {
        self.writable && !self.closed.load(Ordering::Acquire)
    }

    fn watch_len(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// In-memory [`FeedStorage`].
///
/// Logs are retained by URI so that a feed re-opened after its handle was
/// dropped still sees the entries written earlier in the process.
#[derive(Default)]
pub struct InMemoryFeedStorage {
    logs: Mutex<HashMap<String, Arc<InMemoryFeedLog>>>,
    read_only: bool,
}

impl InMemoryFeedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose logs all reject appends.
    pub fn read_only() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            read_only: true,
        }
    }
}

#[async_trait]
impl FeedStorage for InMemoryFeedStorage {
    async fn open(&self, uri: &str) -> StorageResult<Arc<dyn FeedLog>> {
        let writable = !self.read_only;
        let mut logs = self.logs.lock().await;
        let log = logs
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(InMemoryFeedLog::with_entries(Vec::new(), writable)))
            .clone();
        Ok(log)
    }
}

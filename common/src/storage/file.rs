//! File-backed feed storage.
//!
//! Each feed lives in its own directory under the data directory, named by
//! the hex SHA-256 of its URI:
//!
//! ```text
//! <data_dir>/<sha256(uri)>/uri          the feed URI, written on creation
//! <data_dir>/<sha256(uri)>/entries.log  | len (u32 BE) | payload | ...
//! ```
//!
//! The entry file is replayed into memory on open. A trailing record that was
//! only partially written is dropped and, for writable feeds, truncated away.
//! A failed append truncates the file back to its last whole record before
//! returning, so later appends never land behind a torn one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};

use super::config::FileStorageConfig;
use super::{EntryCache, FeedLog, FeedStorage, StorageError, StorageResult};

const ENTRIES_FILE: &str = "entries.log";
const URI_FILE: &str = "uri";
const LEN_PREFIX: usize = 4;

/// Directory name for a feed URI.
pub fn feed_dir_name(uri: &str) -> String {
    format!("{:x}", Sha256::digest(uri.as_bytes()))
}

/// Splits an entry file into payloads. Returns the payloads and the byte
/// length of the well-formed prefix.
fn decode_entries(mut buf: Bytes) -> (Vec<Bytes>, u64) {
    let mut entries = Vec::new();
    let mut valid = 0u64;
    while buf.remaining() >= LEN_PREFIX {
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.remaining() < LEN_PREFIX + len {
            break;
        }
        buf.advance(LEN_PREFIX);
        entries.push(buf.split_to(len));
        valid += (LEN_PREFIX + len) as u64;
    }
    (entries, valid)
}

fn encode_entry(value: &[u8]) -> StorageResult<Bytes> {
    let len = u32::try_from(value.len())
        .map_err(|_| StorageError::Storage(format!("entry of {} bytes is too large", value.len())))?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + value.len());
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(buf.freeze())
}

/// Append handle plus the byte length of the whole records written so far.
struct Writer {
    file: File,
    committed: u64,
    // Set when a failed append could not be rolled back.
    poisoned: bool,
}

impl Writer {
    async fn write_record(&mut self, record: &[u8], sync: bool) -> StorageResult<()> {
        if self.poisoned {
            return Err(StorageError::Storage(
                "entry file holds a partial record that could not be removed".to_string(),
            ));
        }
        match self.persist(record, sync).await {
            Ok(()) => {
                self.committed += record.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.rollback().await;
                Err(err)
            }
        }
    }

    async fn persist(&mut self, record: &[u8], sync: bool) -> StorageResult<()> {
        self.file.write_all(record).await?;
        self.file.flush().await?;
        if sync {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    /// Drops any bytes written past the last whole record.
    async fn rollback(&mut self) {
        if let Err(err) = self.file.set_len(self.committed).await {
            tracing::error!("failed to truncate partial entry: {}", err);
            self.poisoned = true;
        }
    }
}

/// A feed log persisted to a single append-only file.
pub struct FileFeedLog {
    path: PathBuf,
    cache: EntryCache,
    // `None` for read-only logs.
    writer: Option<Mutex<Writer>>,
    sync_writes: bool,
    closed: AtomicBool,
}

impl FileFeedLog {
    /// Opens (creating if needed) the feed stored in `dir`.
    pub async fn open(dir: &Path, read_only: bool, sync_writes: bool) -> StorageResult<Self> {
        let path = dir.join(ENTRIES_FILE);
        let raw = match fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Bytes::new(),
            Err(err) => return Err(err.into()),
        };
        let total = raw.len() as u64;
        let (entries, valid) = decode_entries(raw);
        if valid < total {
            tracing::warn!(
                "dropping {} trailing bytes of partial entry in {}",
                total - valid,
                path.display()
            );
        }

        let writer = if read_only {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            if valid < total {
                file.set_len(valid).await?;
            }
            Some(Mutex::new(Writer {
                file,
                committed: valid,
                poisoned: false,
            }))
        };

        Ok(Self {
            path,
            cache: EntryCache::new(entries),
            writer,
            sync_writes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedLog for FileFeedLog {
    async fn append(&self, value: Bytes) -> StorageResult<u64> {
        let Some(writer) = &self.writer else {
            return Err(StorageError::NotWritable);
        };
        let record = encode_entry(&value)?;

        // Holding the file lock across the cache push keeps index order equal
        // to file order.
        let mut writer = writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        writer.write_record(&record, self.sync_writes).await?;
        Ok(self.cache.push(value).await)
    }

    async fn get(&self, index: u64) -> StorageResult<Option<Bytes>> {
        Ok(self.cache.get(index).await)
    }

    fn len(&self) -> u64 {
        self.cache.len()
    }

    fn is_writable(&self) -> bool {
        self.writer.is_some() && !self.closed.load(Ordering::Acquire)
    }

    fn watch_len(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            writer.file.flush().await?;
            writer.file.sync_all().await?;
        }
        Ok(())
    }
}

/// [`FeedStorage`] keeping one directory per feed under a data directory.
pub struct FileFeedStorage {
    root: PathBuf,
    read_only: bool,
    sync_writes: bool,
}

impl FileFeedStorage {
    pub fn new(config: &FileStorageConfig) -> StorageResult<Self> {
        if !config.read_only {
            std::fs::create_dir_all(&config.path).map_err(|e| {
                StorageError::Storage(format!(
                    "Failed to create data directory '{}': {}",
                    config.path, e
                ))
            })?;
        }
        Ok(Self {
            root: PathBuf::from(&config.path),
            read_only: config.read_only,
            sync_writes: config.sync_writes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FeedStorage for FileFeedStorage {
    async fn open(&self, uri: &str) -> StorageResult<Arc<dyn FeedLog>> {
        let dir = self.root.join(feed_dir_name(uri));
        if !self.read_only && !fs::try_exists(&dir).await? {
            fs::create_dir_all(&dir).await?;
            fs::write(dir.join(URI_FILE), uri.as_bytes()).await?;
            tracing::debug!("created feed directory {} for {}", dir.display(), uri);
        }
        let log = FileFeedLog::open(&dir, self.read_only, self.sync_writes).await?;
        Ok(Arc::new(log))
    }
}

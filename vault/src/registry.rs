//! Process-wide registry of open feeds keyed by URI.
//!
//! At most one [`Feed`] exists per URI. The first opener drives the storage
//! open; concurrent openers of the same URI await that same in-flight open
//! (a [`Shared`] future) instead of starting their own. A failed open is
//! evicted, so the next opener retries from scratch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use common::{EntryStream, FeedLog, FeedStorage, ReadRange, read_range};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::FuturesUnordered;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// An open append-only log shared by every session bound to its URI.
pub struct Feed {
    uri: String,
    log: Arc<dyn FeedLog>,
}

impl Feed {
    pub fn new(uri: String, log: Arc<dyn FeedLog>) -> Self {
        Self { uri, log }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn len(&self) -> u64 {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.log.is_writable()
    }

    /// Appends `value`, returning its zero-based index.
    pub async fn append(&self, value: Bytes) -> Result<u64> {
        if !self.log.is_writable() {
            return Err(Error::NotWritable);
        }
        Ok(self.log.append(value).await?)
    }

    pub fn read(&self, range: ReadRange) -> EntryStream {
        read_range(self.log.clone(), range)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.log.close().await?)
    }
}

type OpenFuture = Shared<BoxFuture<'static, Result<Arc<Feed>>>>;

enum Slot {
    Opening { generation: u64, future: OpenFuture },
    Ready(Arc<Feed>),
}

/// Observable state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Opening,
    Ready,
}

/// Outcome of [`FeedRegistry::close_all`].
#[derive(Debug, Default)]
pub struct SweepReport {
    pub closed: usize,
    pub errors: Vec<(String, Error)>,
    /// Feeds still closing (or still opening) when the grace period ran out.
    pub abandoned: usize,
}

pub struct FeedRegistry {
    storage: Arc<dyn FeedStorage>,
    feeds: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
    metrics: Arc<Metrics>,
}

impl FeedRegistry {
    pub fn new(storage: Arc<dyn FeedStorage>, metrics: Arc<Metrics>) -> Self {
        Self {
            storage,
            feeds: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Returns the feed for `uri`, opening it on first use.
    pub async fn open(&self, uri: &str) -> Result<Arc<Feed>> {
        let (generation, future) = {
            let mut feeds = self.feeds.lock().await;
            match feeds.get(uri) {
                Some(Slot::Ready(feed)) => return Ok(feed.clone()),
                Some(Slot::Opening { generation, future }) => (*generation, future.clone()),
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let future = self.open_future(uri.to_string());
                    feeds.insert(
                        uri.to_string(),
                        Slot::Opening {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut feeds = self.feeds.lock().await;
        let current = matches!(
            feeds.get(uri),
            Some(Slot::Opening { generation: g, .. }) if *g == generation
        );
        if current {
            match &result {
                Ok(feed) => {
                    feeds.insert(uri.to_string(), Slot::Ready(feed.clone()));
                    self.metrics.feeds_open.inc();
                    tracing::info!("feed {} is ready with {} entries", uri, feed.len());
                }
                Err(err) => {
                    feeds.remove(uri);
                    tracing::warn!("failed to open feed {}: {}", uri, err);
                }
            }
        }
        result
    }

    fn open_future(&self, uri: String) -> OpenFuture {
        let storage = self.storage.clone();
        async move {
            tracing::debug!("opening feed {}", uri);
            let log = storage.open(&uri).await?;
            Ok(Arc::new(Feed::new(uri, log)))
        }
        .boxed()
        .shared()
    }

    pub async fn state(&self, uri: &str) -> Option<FeedState> {
        self.feeds.lock().await.get(uri).map(|slot| match slot {
            Slot::Opening { .. } => FeedState::Opening,
            Slot::Ready(_) => FeedState::Ready,
        })
    }

    /// Number of registry entries, opening or ready.
    pub async fn len(&self) -> usize {
        self.feeds.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every ready feed concurrently and empties the registry.
    ///
    /// Individual close errors are collected rather than propagated. Feeds
    /// whose close has not finished after `grace` are abandoned.
    pub async fn close_all(&self, grace: Duration) -> SweepReport {
        let slots: Vec<(String, Slot)> = self.feeds.lock().await.drain().collect();

        let mut report = SweepReport::default();
        let mut closing = FuturesUnordered::new();
        for (uri, slot) in slots {
            match slot {
                Slot::Ready(feed) => {
                    self.metrics.feeds_open.dec();
                    closing.push(async move { (uri, feed.close().await) });
                }
                Slot::Opening { .. } => {
                    tracing::debug!("abandoning feed {} that is still opening", uri);
                    report.abandoned += 1;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, closing.next()).await {
                Ok(Some((_, Ok(())))) => report.closed += 1,
                Ok(Some((uri, Err(err)))) => {
                    tracing::warn!("failed to close feed {}: {}", uri, err);
                    report.errors.push((uri, err));
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "abandoning {} feeds still closing after {:?}",
                        closing.len(),
                        grace
                    );
                    report.abandoned += closing.len();
                    break;
                }
            }
        }

        tracing::info!(
            "closed {} feeds ({} errors, {} abandoned)",
            report.closed,
            report.errors.len(),
            report.abandoned
        );
        report
    }
}

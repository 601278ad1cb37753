//! Storage factory for creating feed storage from configuration.

use std::sync::Arc;

use super::config::StorageConfig;
use super::file::FileFeedStorage;
use super::in_memory::InMemoryFeedStorage;
use super::{FeedStorage, StorageResult};

/// Creates a storage instance based on the provided configuration.
///
/// # Examples
///
/// ```rust,ignore
/// use common::{StorageConfig, create_storage};
///
/// let storage = create_storage(&StorageConfig::InMemory).await?;
/// let log = storage.open("feed://orders").await?;
/// ```
pub async fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn FeedStorage>> {
    match config {
        StorageConfig::InMemory => Ok(Arc::new(InMemoryFeedStorage::new())),
        StorageConfig::File(file_config) => {
            let storage = FileFeedStorage::new(file_config)?;
            tracing::info!("Using file storage in {}", storage.root().display());
            Ok(Arc::new(storage))
        }
    }
}

//! Storage configuration types.
//!
//! Services pick a backend (InMemory or File) through their config file; the
//! enum is internally tagged so YAML reads as `type: File`.

use serde::{Deserialize, Serialize};

/// Top-level storage configuration.
///
/// Defaults to `File` storage under `./data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StorageConfig {
    InMemory,
    File(FileStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File(FileStorageConfig::default())
    }
}

/// File backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileStorageConfig {
    /// Data directory holding one sub-directory per feed.
    #[serde(default = "default_data_dir")]
    pub path: String,

    /// Open every feed read-only. Appends fail with `NotWritable`.
    #[serde(default)]
    pub read_only: bool,

    /// Call `fdatasync` after every append.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_sync_writes() -> bool {
    true
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
            read_only: false,
            sync_writes: default_sync_writes(),
        }
    }
}

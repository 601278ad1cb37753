//! Command line arguments for the vault binary.

use std::time::Duration;

use clap::Parser;
use common::{FileStorageConfig, StorageConfig};

use crate::config::{VaultConfig, load_config};
use crate::error::Result;
use crate::proto::DEFAULT_SERVICE_PORT;

/// CLI arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "vault")]
#[command(about = "Multiplexed append-only feed service")]
pub struct CliArgs {
    /// Path to the vault.yaml configuration file
    #[arg(short, long, env = "VAULT_CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_SERVICE_PORT, env = "VAULT_PORT")]
    pub port: u16,

    /// Data directory for file storage; overrides the configured path
    #[arg(long, env = "VAULT_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Keep feeds in memory only
    #[arg(long, conflicts_with = "data_dir")]
    pub in_memory: bool,
}

impl CliArgs {
    /// Loads the configuration file, if any, and applies storage overrides.
    pub fn to_vault_config(&self) -> Result<VaultConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => VaultConfig::default(),
        };

        if self.in_memory {
            config.storage = StorageConfig::InMemory;
        } else if let Some(dir) = &self.data_dir {
            config.storage = match config.storage {
                StorageConfig::File(file) => StorageConfig::File(FileStorageConfig {
                    path: dir.clone(),
                    ..file
                }),
                StorageConfig::InMemory => StorageConfig::File(FileStorageConfig {
                    path: dir.clone(),
                    ..Default::default()
                }),
            };
        }
        Ok(config)
    }
}

/// Settings the HTTP server needs at runtime.
#[derive(Debug, Clone)]
pub struct VaultServerConfig {
    pub port: u16,
    pub shutdown_grace: Duration,
    pub outbound_buffer: usize,
}

impl VaultServerConfig {
    pub fn new(args: &CliArgs, config: &VaultConfig) -> Result<Self> {
        Ok(Self {
            port: args.port,
            shutdown_grace: config.shutdown_grace()?,
            outbound_buffer: config.outbound_buffer,
        })
    }
}

//! Vault feed server binary entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::create_storage;
use vault::server::{CliArgs, VaultServer, VaultServerConfig};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();

    let config = match args.to_vault_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };
    let server_config = match VaultServerConfig::new(&args, &config) {
        Ok(server_config) => server_config,
        Err(err) => {
            tracing::error!("Invalid server configuration: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!("Opening feed storage with config: {:?}", config.storage);

    let storage = match create_storage(&config.storage).await {
        Ok(storage) => storage,
        Err(err) => {
            tracing::error!("Failed to open storage: {}", err);
            std::process::exit(1);
        }
    };

    // Create and run the server
    let server = VaultServer::new(storage, server_config);
    if let Err(err) = server.run().await {
        tracing::error!("Server error: {}", err);
        std::process::exit(1);
    }
}

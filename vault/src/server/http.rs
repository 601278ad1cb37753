//! HTTP server implementation for the vault feed service.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use common::FeedStorage;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use super::config::VaultServerConfig;
use super::handlers::{AppState, handle_healthy, handle_metrics, handle_pipe, handle_ready};
use crate::metrics::Metrics;
use crate::registry::FeedRegistry;

/// HTTP server for the feed service.
pub struct VaultServer {
    storage: Arc<dyn FeedStorage>,
    config: VaultServerConfig,
}

impl VaultServer {
    pub fn new(storage: Arc<dyn FeedStorage>, config: VaultServerConfig) -> Self {
        Self { storage, config }
    }

    /// Run the HTTP server until a shutdown signal or a fatal connection
    /// error, then close every open feed.
    pub async fn run(self) -> std::io::Result<()> {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(FeedRegistry::new(self.storage, metrics.clone()));
        let shutdown = CancellationToken::new();
        let fault = CancellationToken::new();

        let state = AppState {
            registry: registry.clone(),
            metrics,
            outbound_buffer: self.config.outbound_buffer,
            shutdown: shutdown.clone(),
            fault: fault.clone(),
        };

        let app = Router::new()
            .route("/api/v1/feeds/pipe", get(handle_pipe))
            .route("/metrics", get(handle_metrics))
            .route("/-/healthy", get(handle_healthy))
            .route("/-/ready", get(handle_ready))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        tracing::info!("Starting vault server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone(), fault.clone()))
            .await?;

        // Stop WebSocket connections, which outlive axum's graceful shutdown.
        shutdown.cancel();
        let report = registry.close_all(self.config.shutdown_grace).await;
        if !report.errors.is_empty() || report.abandoned > 0 {
            tracing::warn!(
                "{} feeds failed to close and {} were abandoned",
                report.errors.len(),
                report.abandoned
            );
        }

        if fault.is_cancelled() {
            return Err(std::io::Error::other(
                "server stopped after a fatal connection error",
            ));
        }
        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Resolves on SIGTERM (K8s pod termination), SIGINT (Ctrl+C) or a fatal
/// connection error.
async fn shutdown_signal(shutdown: CancellationToken, fault: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
        _ = fault.cancelled() => tracing::error!("Fatal connection error, starting shutdown"),
    }
    shutdown.cancel();
}

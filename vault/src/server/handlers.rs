//! HTTP route handlers for the vault server.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt, future};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{WireFormat, decode_frame};
use crate::connection::FeedConnection;
use crate::metrics::Metrics;
use crate::registry::FeedRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FeedRegistry>,
    pub metrics: Arc<Metrics>,
    pub outbound_buffer: usize,
    /// Cancelled when the server starts shutting down.
    pub shutdown: CancellationToken,
    /// Cancelled by a connection that hit a fatal error.
    pub fault: CancellationToken,
}

/// Handle GET /api/v1/feeds/pipe
///
/// Upgrades to a WebSocket carrying feed envelopes. Outbound frames use the
/// format matching the `Accept` header.
pub async fn handle_pipe(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let format = WireFormat::from_headers(&headers);
    ws.on_upgrade(move |socket| serve_socket(state, socket, format))
}

async fn serve_socket(state: AppState, socket: WebSocket, format: WireFormat) {
    let (mut sink, source) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.outbound_buffer);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match format.encode(&msg) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!("failed to encode outbound envelope: {}", err);
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // A transport error or a close frame ends the inbound side.
    let inbound = source
        .take_while(|frame| future::ready(matches!(frame, Ok(f) if !matches!(f, Message::Close(_)))))
        .filter_map(|frame| future::ready(frame.ok().as_ref().and_then(decode_frame)));

    let connection = FeedConnection::new(state.registry.clone(), tx, state.metrics.clone());
    tracing::debug!("client connected");
    if let Err(err) = connection.serve(inbound, state.shutdown.clone()).await {
        tracing::error!("fatal error on connection: {}", err);
        state.fault.cancel();
    }

    if let Err(err) = writer.await {
        tracing::warn!("connection writer failed: {}", err);
    }
    tracing::debug!("client disconnected");
}

/// Handle GET /metrics
pub async fn handle_metrics(State(state): State<AppState>) -> String {
    state.metrics.encode()
}

/// Handle GET /-/healthy
pub async fn handle_healthy() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Handle GET /-/ready
pub async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "OK")
    }
}

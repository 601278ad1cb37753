//! Prometheus metrics for the feed service.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::proto::FeedMsgOp;

/// Labels for protocol request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub op: OpLabel,
    pub outcome: Outcome,
}

/// Request operation label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OpLabel {
    Open,
    Close,
    Append,
    Other,
}

impl From<i32> for OpLabel {
    fn from(code: i32) -> Self {
        match FeedMsgOp::try_from(code) {
            Ok(FeedMsgOp::OpenFeed) => OpLabel::Open,
            Ok(FeedMsgOp::CancelReq) => OpLabel::Close,
            Ok(FeedMsgOp::AppendEntry) => OpLabel::Append,
            _ => OpLabel::Other,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Complete,
    Discarded,
}

/// Container for all Prometheus metrics.
///
/// Counters are registered without the `_total` suffix; the text encoder
/// appends it.
pub struct Metrics {
    registry: Registry,

    /// Gauge of open client connections.
    pub connections_active: Gauge,

    /// Gauge of stream sessions across all connections.
    pub sessions_active: Gauge,

    /// Gauge of feeds held open by the registry.
    pub feeds_open: Gauge,

    /// Counter of answered requests.
    pub requests_total: Family<RequestLabels, Counter>,

    /// Counter of entries appended through the service.
    pub entries_appended_total: Counter,

    /// Counter of bytes appended
    pub append_bytes_total: Counter,

    /// Counter of entries pushed to clients by read-streams.
    pub entries_delivered_total: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_active = Gauge::default();
        registry.register(
            "vault_connections_active",
            "Number of client connections currently open",
            connections_active.clone(),
        );

        let sessions_active = Gauge::default();
        registry.register(
            "vault_sessions_active",
            "Number of stream sessions currently open",
            sessions_active.clone(),
        );

        let feeds_open = Gauge::default();
        registry.register(
            "vault_feeds_open",
            "Number of feeds held open by the registry",
            feeds_open.clone(),
        );

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "vault_requests",
            "Total number of protocol requests answered",
            requests_total.clone(),
        );

        let entries_appended_total = Counter::default();
        registry.register(
            "vault_entries_appended",
            "Total number of entries appended to feeds",
            entries_appended_total.clone(),
        );

        let append_bytes_total = Counter::default();
        registry.register(
            "vault_append_bytes",
            "Total number of entry bytes appended to feeds",
            append_bytes_total.clone(),
        );

        let entries_delivered_total = Counter::default();
        registry.register(
            "vault_entries_delivered",
            "Total number of entries delivered to clients",
            entries_delivered_total.clone(),
        );

        Self {
            registry,
            connections_active,
            sessions_active,
            feeds_open,
            requests_total,
            entries_appended_total,
            append_bytes_total,
            entries_delivered_total,
        }
    }

    /// Records the outcome of a request with operation code `op`.
    pub fn record_request(&self, op: i32, outcome: Outcome) {
        self.requests_total
            .get_or_create(&RequestLabels {
                op: OpLabel::from(op),
                outcome,
            })
            .inc();
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            tracing::warn!("failed to encode metrics: {}", err);
        }
        buffer
    }
}

//! Vault: a multiplexed feed service.
//!
//! Clients hold one duplex connection and open any number of stream
//! sessions on it, each identified by a client-chosen non-zero ID and bound
//! to an append-only feed named by URI. Through a session a client appends
//! entries and receives entries pushed from a configurable starting point,
//! either as a bounded snapshot or as a live tail.
//!
//! - [`proto`]: the [`FeedMsg`](proto::FeedMsg) envelope and its payloads.
//! - [`registry`]: process-wide, single-flight feed registry.
//! - [`session`]: per-session state, appends and the read-stream.
//! - [`connection`]: per-connection session table and dispatch.
//! - [`server`]: WebSocket transport, metrics and health endpoints.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod read_config;
pub mod registry;
pub mod response;
pub mod server;
pub mod session;

pub use config::{VaultConfig, load_config};
pub use connection::{FeedConnection, Operation};
pub use error::{Error, ErrorKind, Result};
pub use metrics::Metrics;
pub use registry::{Feed, FeedRegistry, FeedState, SweepReport};
pub use session::StreamSession;

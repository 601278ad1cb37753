//! WebSocket transport and HTTP endpoints for the feed service.

mod config;
mod frame;
mod handlers;
mod http;

pub use config::{CliArgs, VaultServerConfig};
pub use frame::{WireFormat, decode_frame};
pub use http::VaultServer;

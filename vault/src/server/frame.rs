//! WebSocket frame encoding for feed envelopes.
//!
//! Binary frames carry protobuf-encoded [`FeedMsg`]s, text frames carry
//! the JSON mapping from [`crate::proto`]. Inbound frames may use either; outbound frames use the format
//! chosen from the upgrade request's `Accept` header.

use axum::extract::ws::Message;
use axum::http::{HeaderMap, header};
use bytes::Bytes;
use prost::Message as _;

use crate::error::Result;
use crate::proto::FeedMsg;

/// Content type for binary protobuf.
pub(super) const CONTENT_TYPE_PROTOBUF: &str = "application/protobuf";

/// Content type for JSON-encoded envelopes.
pub(super) const CONTENT_TYPE_JSON: &str = "application/protobuf+json";

fn is_binary_protobuf(media_type: &str) -> bool {
    media_type.contains(CONTENT_TYPE_PROTOBUF) && !media_type.contains(CONTENT_TYPE_JSON)
}

/// Encoding used for outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Protobuf,
}

impl WireFormat {
    /// Protobuf only for `application/protobuf`, not `application/protobuf+json`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let wants_protobuf = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(is_binary_protobuf)
            .unwrap_or(false);

        if wants_protobuf {
            WireFormat::Protobuf
        } else {
            WireFormat::Json
        }
    }

    pub fn encode(self, msg: &FeedMsg) -> Result<Message> {
        match self {
            WireFormat::Json => Ok(Message::Text(serde_json::to_string(msg)?.into())),
            WireFormat::Protobuf => Ok(Message::Binary(Bytes::from(msg.encode_to_vec()))),
        }
    }
}

/// Decodes an inbound data frame. Control frames yield `None`.
pub fn decode_frame(frame: &Message) -> Option<Result<FeedMsg>> {
    match frame {
        Message::Binary(data) => Some(FeedMsg::decode(data.clone()).map_err(Into::into)),
        Message::Text(text) => Some(serde_json::from_str(text.as_str()).map_err(Into::into)),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

//! Protobuf message definitions for the feed protocol.
//!
//! Every frame on a connection is a [`FeedMsg`] envelope. Its `msg_data`
//! carries the operation payload: a nested [`OpenFeedReq`] for opens, the raw
//! entry bytes for appends and deliveries, a [`ReqErr`] for discarded
//! requests. Text frames use a plain serde JSON mapping of the same types:
//! camelCase field names, base64 bytes, and integer IDs and enum values.
//! Unlike proto3 JSON, 64-bit IDs are JSON numbers rather than strings.

use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

/// Port the service listens on when none is configured.
pub const DEFAULT_SERVICE_PORT: u16 = 5192;

/// Operation carried by a [`FeedMsg`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FeedMsgOp {
    Unspecified = 0,
    OpenFeed = 1,
    CancelReq = 2,
    AppendEntry = 3,
    RecvEntry = 4,
    ReqComplete = 5,
    ReqDiscarded = 6,
}

/// Where a read-stream starts relative to the feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StreamMode {
    AtEntry = 0,
    AfterEntry = 1,
    AfterHead = 2,
    FromGenesis = 3,
    DontStream = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrCode {
    UnnamedErr = 0,
}

/// The envelope exchanged in both directions.
#[serde_as]
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMsg {
    /// Correlates a response with its request.
    #[prost(uint64, tag = "1")]
    #[serde(default)]
    pub req_id: u64,
    /// Session ID the message belongs to.
    #[prost(uint64, tag = "2")]
    #[serde(default)]
    pub feed_id: u64,
    #[prost(enumeration = "FeedMsgOp", tag = "3")]
    #[serde(default)]
    pub msg_op: i32,
    #[prost(uint64, tag = "4")]
    #[serde(default)]
    pub entry_id: u64,
    #[prost(bytes = "bytes", tag = "5")]
    #[serde_as(as = "Base64")]
    #[serde(default)]
    pub msg_data: Bytes,
}

impl FeedMsg {
    /// Envelope requesting that session `feed_id` open a feed.
    pub fn open(req_id: u64, feed_id: u64, request: &OpenFeedReq) -> Self {
        Self {
            req_id,
            feed_id,
            msg_op: FeedMsgOp::OpenFeed as i32,
            entry_id: 0,
            msg_data: Bytes::from(request.encode_to_vec()),
        }
    }

    /// Envelope appending `data` through session `feed_id`.
    pub fn append(req_id: u64, feed_id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            req_id,
            feed_id,
            msg_op: FeedMsgOp::AppendEntry as i32,
            entry_id: 0,
            msg_data: data.into(),
        }
    }

    /// Envelope closing session `feed_id`.
    pub fn cancel(req_id: u64, feed_id: u64) -> Self {
        Self {
            req_id,
            feed_id,
            msg_op: FeedMsgOp::CancelReq as i32,
            entry_id: 0,
            msg_data: Bytes::new(),
        }
    }

    /// The operation, or `None` for codes this build does not know.
    pub fn op(&self) -> Option<FeedMsgOp> {
        FeedMsgOp::try_from(self.msg_op).ok()
    }
}

/// Payload of an `OpenFeed` envelope.
#[serde_as]
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFeedReq {
    #[prost(string, tag = "1")]
    pub feed_uri: String,
    #[prost(enumeration = "StreamMode", tag = "2")]
    #[serde(default)]
    pub stream_mode: i32,
    #[prost(uint64, tag = "3")]
    #[serde(default)]
    pub seek_entry_id: u64,
    /// Zero means stream indefinitely.
    #[prost(uint64, tag = "4")]
    #[serde(default)]
    pub max_entries_to_send: u64,
    #[prost(bool, tag = "5")]
    #[serde(default)]
    pub send_entry_ids_only: bool,
    /// Entry written to the feed before streaming starts; only `msg_data`
    /// is used.
    #[prost(message, optional, tag = "6")]
    #[serde(default)]
    pub genesis_entry: Option<FeedMsg>,
    /// Opaque to the service.
    #[prost(bytes = "bytes", optional, tag = "7")]
    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub vault_ctx: Option<Bytes>,
}

impl OpenFeedReq {
    pub fn new(feed_uri: impl Into<String>, mode: StreamMode) -> Self {
        Self {
            feed_uri: feed_uri.into(),
            stream_mode: mode as i32,
            ..Default::default()
        }
    }

    pub fn with_seek(mut self, seek_entry_id: u64) -> Self {
        self.seek_entry_id = seek_entry_id;
        self
    }

    pub fn with_max_entries(mut self, max_entries_to_send: u64) -> Self {
        self.max_entries_to_send = max_entries_to_send;
        self
    }

    pub fn with_ids_only(mut self) -> Self {
        self.send_entry_ids_only = true;
        self
    }

    pub fn with_genesis(mut self, data: impl Into<Bytes>) -> Self {
        self.genesis_entry = Some(FeedMsg {
            msg_data: data.into(),
            ..Default::default()
        });
        self
    }
}

/// Payload of a `ReqDiscarded` envelope.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReqErr {
    #[prost(enumeration = "ErrCode", tag = "1")]
    #[serde(default)]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub msg: String,
}

//! Builders for outbound envelopes.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::metrics::{Metrics, Outcome};
use crate::proto::{ErrCode, FeedMsg, FeedMsgOp, ReqErr};

/// `ReqComplete` answer to `request`, carrying `entry_id`.
pub fn complete(request: &FeedMsg, entry_id: u64) -> FeedMsg {
    FeedMsg {
        req_id: request.req_id,
        feed_id: request.feed_id,
        msg_op: FeedMsgOp::ReqComplete as i32,
        entry_id,
        msg_data: Bytes::new(),
    }
}

/// `ReqDiscarded` answer to `request` carrying `err` as a [`ReqErr`].
pub fn discarded(request: &FeedMsg, err: &Error) -> FeedMsg {
    let payload = ReqErr {
        code: ErrCode::UnnamedErr as i32,
        msg: err.to_string(),
    };
    FeedMsg {
        req_id: request.req_id,
        feed_id: request.feed_id,
        msg_op: FeedMsgOp::ReqDiscarded as i32,
        entry_id: 0,
        msg_data: Bytes::from(payload.encode_to_vec()),
    }
}

/// Entry pushed by a read-stream. Both IDs are the session ID.
pub fn entry(session_id: u64, entry_id: u64, data: Bytes) -> FeedMsg {
    FeedMsg {
        req_id: session_id,
        feed_id: session_id,
        msg_op: FeedMsgOp::RecvEntry as i32,
        entry_id,
        msg_data: data,
    }
}

/// Sends answers onto a connection's outbound queue and counts them.
#[derive(Clone)]
pub struct Responder {
    outbound: mpsc::Sender<FeedMsg>,
    metrics: Arc<Metrics>,
}

impl Responder {
    pub fn new(outbound: mpsc::Sender<FeedMsg>, metrics: Arc<Metrics>) -> Self {
        Self { outbound, metrics }
    }

    pub fn outbound(&self) -> &mpsc::Sender<FeedMsg> {
        &self.outbound
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Answers `request` with the outcome of its operation. Returns `false`
    /// once the connection's writer is gone.
    pub async fn respond(&self, request: &FeedMsg, result: Result<u64, Error>) -> bool {
        let (msg, outcome) = match result {
            Ok(entry_id) => (complete(request, entry_id), Outcome::Complete),
            Err(err) => {
                tracing::debug!(
                    "discarding request {} on session {}: {}",
                    request.req_id,
                    request.feed_id,
                    err
                );
                (discarded(request, &err), Outcome::Discarded)
            }
        };
        self.metrics.record_request(request.msg_op, outcome);
        self.outbound.send(msg).await.is_ok()
    }
}

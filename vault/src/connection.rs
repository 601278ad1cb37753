//! Per-connection session table and request dispatch.
//!
//! A [`FeedConnection`] owns every session a client opened on one duplex
//! connection. Inbound envelopes are decoded into an [`Operation`] and
//! routed by session ID: opens create the session on first use, appends and
//! closes require it to exist. All responses and deliveries share one
//! bounded outbound channel that the transport drains.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::proto::{FeedMsg, FeedMsgOp, OpenFeedReq};
use crate::registry::FeedRegistry;
use crate::response::Responder;
use crate::session::{Command, SessionEvent, SessionHandle, StreamSession};

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Open(OpenFeedReq),
    Close,
    Append(Bytes),
    Unsupported(i32),
}

impl Operation {
    pub fn decode(msg: &FeedMsg) -> Result<Self> {
        match msg.op() {
            Some(FeedMsgOp::OpenFeed) => Ok(Operation::Open(OpenFeedReq::decode(
                msg.msg_data.clone(),
            )?)),
            Some(FeedMsgOp::CancelReq) => Ok(Operation::Close),
            Some(FeedMsgOp::AppendEntry) => Ok(Operation::Append(msg.msg_data.clone())),
            _ => Ok(Operation::Unsupported(msg.msg_op)),
        }
    }
}

pub struct FeedConnection {
    registry: Arc<FeedRegistry>,
    responder: Responder,
    metrics: Arc<Metrics>,
    sessions: HashMap<u64, SessionHandle>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_generation: u64,
}

impl FeedConnection {
    pub fn new(
        registry: Arc<FeedRegistry>,
        outbound: mpsc::Sender<FeedMsg>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            responder: Responder::new(outbound, metrics.clone()),
            metrics,
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            next_generation: 0,
        }
    }

    /// Serves `inbound` until it ends or `stop` fires, then closes every
    /// session on the connection.
    ///
    /// Inbound items that failed to decode are answered with a
    /// `ReqDiscarded` envelope. The loop also ends once the outbound writer
    /// is gone. Returns an error only when an internal invariant broke; the
    /// caller should treat it as fatal.
    pub async fn serve<S>(mut self, inbound: S, stop: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<FeedMsg>> + Send,
    {
        self.metrics.connections_active.inc();
        let mut inbound = std::pin::pin!(inbound);

        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                _ = self.responder.outbound().closed() => {
                    tracing::debug!("outbound writer gone; ending connection");
                    break Ok(());
                }
                Some(event) = self.events_rx.recv() => self.on_event(event),
                next = inbound.next() => match next {
                    Some(Ok(msg)) => {
                        if let Err(err) = self.dispatch(msg).await {
                            break Err(err);
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!("rejecting undecodable frame: {}", err);
                        if !self.responder.respond(&FeedMsg::default(), Err(err)).await {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        self.shutdown().await;
        self.metrics.connections_active.dec();
        result
    }

    async fn dispatch(&mut self, msg: FeedMsg) -> Result<()> {
        let operation = match Operation::decode(&msg) {
            Ok(operation) => operation,
            Err(err) => {
                self.responder.respond(&msg, Err(err)).await;
                return Ok(());
            }
        };

        match operation {
            Operation::Open(request) => self.open(msg, request).await,
            Operation::Append(data) => {
                if !self.sessions.contains_key(&msg.feed_id) {
                    let err = Error::NotOpen(msg.feed_id);
                    self.responder.respond(&msg, Err(err)).await;
                    return Ok(());
                }
                self.send(msg.feed_id, Command::Append { request: msg, data })
                    .await
            }
            Operation::Close => self.close(msg).await,
            Operation::Unsupported(code) => {
                self.responder.respond(&msg, Err(Error::Unsupported(code))).await;
                Ok(())
            }
        }
    }

    async fn open(&mut self, msg: FeedMsg, request: OpenFeedReq) -> Result<()> {
        let id = msg.feed_id;
        if id == 0 {
            self.responder.respond(&msg, Err(Error::InvalidSessionId)).await;
            return Ok(());
        }

        if !self.sessions.contains_key(&id) {
            tracing::info!("opening session {} on {}", id, request.feed_uri);
            let session = StreamSession::new(id, self.registry.clone(), self.responder.clone());
            let generation = self.next_generation;
            self.next_generation += 1;
            let handle = SessionHandle::spawn(session, generation, self.events_tx.clone());
            self.sessions.insert(id, handle);
            self.metrics.sessions_active.inc();
        } else {
            tracing::info!("resetting session {} on {}", id, request.feed_uri);
        }

        let Some(handle) = self.sessions.get_mut(&id) else {
            return Err(Error::Fatal(format!("session {} missing from table", id)));
        };
        match handle.open(msg, request) {
            Ok(()) => Ok(()),
            Err(command) => {
                self.remove_stopped(id, command).await;
                Ok(())
            }
        }
    }

    async fn close(&mut self, msg: FeedMsg) -> Result<()> {
        let Some(handle) = self.sessions.remove(&msg.feed_id) else {
            let err = Error::NotOpen(msg.feed_id);
            self.responder.respond(&msg, Err(err)).await;
            return Ok(());
        };
        self.metrics.sessions_active.dec();
        tracing::info!("closing session {}", msg.feed_id);
        // The actor answers the close itself once its reader has stopped.
        handle.close(Some(msg));
        Ok(())
    }

    async fn send(&mut self, id: u64, command: Command) -> Result<()> {
        let Some(handle) = self.sessions.get(&id) else {
            return Err(Error::Fatal(format!("session {} missing from table", id)));
        };
        if let Err(command) = handle.send(command) {
            self.remove_stopped(id, command).await;
        }
        Ok(())
    }

    /// Drops a session whose actor has already exited and answers the
    /// command it could not take as if the session were never open.
    async fn remove_stopped(&mut self, id: u64, command: Command) {
        if self.sessions.remove(&id).is_some() {
            self.metrics.sessions_active.dec();
        }
        tracing::debug!("session {} stopped; removing it from the table", id);
        if let Some(request) = command.request() {
            self.responder.respond(request, Err(Error::NotOpen(id))).await;
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Unbound {
                id,
                generation,
                seq,
            } => {
                // A later open may already be queued behind the failed one.
                let current = self.sessions.get(&id).is_some_and(|handle| {
                    handle.generation() == generation && handle.last_open() == seq
                });
                if !current {
                    return;
                }
                if let Some(handle) = self.sessions.remove(&id) {
                    self.metrics.sessions_active.dec();
                    tracing::debug!("removing session {} after failed open", id);
                    handle.retire();
                }
            }
        }
    }

    /// Closes every remaining session and waits for their actors to stop.
    /// A session that fails to stop cleanly is logged; the rest still close.
    async fn shutdown(&mut self) {
        let mut tasks = Vec::new();
        for (id, handle) in self.sessions.drain() {
            self.metrics.sessions_active.dec();
            tasks.push((id, handle.close(None)));
        }

        for (id, task) in tasks {
            if let Err(err) = task.await {
                tracing::warn!("session {} did not close cleanly: {}", id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::StreamMode;

    #[test]
    fn should_decode_open_operation() {
        // given
        let request = OpenFeedReq::new("feed://a", StreamMode::AfterHead);
        let msg = FeedMsg::open(1, 2, &request);

        // when
        let operation = Operation::decode(&msg).unwrap();

        // then
        assert_eq!(operation, Operation::Open(request));
    }

    #[test]
    fn should_reject_malformed_open_payload() {
        // given
        let msg = FeedMsg {
            msg_op: FeedMsgOp::OpenFeed as i32,
            msg_data: Bytes::from_static(&[0xff, 0xff, 0xff]),
            ..Default::default()
        };

        // when
        let result = Operation::decode(&msg);

        // then
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn should_treat_server_side_ops_as_unsupported() {
        // given
        let msg = FeedMsg {
            msg_op: FeedMsgOp::RecvEntry as i32,
            ..Default::default()
        };

        // when
        let operation = Operation::decode(&msg).unwrap();

        // then
        assert_eq!(
            operation,
            Operation::Unsupported(FeedMsgOp::RecvEntry as i32)
        );
    }

    #[test]
    fn should_carry_append_payload() {
        // given
        let msg = FeedMsg::append(1, 1, "payload");

        // when
        let operation = Operation::decode(&msg).unwrap();

        // then
        assert_eq!(operation, Operation::Append(Bytes::from("payload")));
    }
}

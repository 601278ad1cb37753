//! Stream sessions.
//!
//! A [`StreamSession`] binds a client-chosen session ID to a feed. It appends
//! on the client's behalf and, unless the open asked for `DontStream`, runs a
//! read-stream task that pushes entries to the connection as `RecvEntry`
//! envelopes.
//!
//! Each session is driven by its own actor task fed through a
//! [`SessionHandle`]. Commands for one session are handled strictly in
//! arrival order, while sessions on the same connection make progress
//! independently. Opening is two-phase: the open response is queued on the
//! outbound channel first, then [`StreamSession::activate`] starts the reader,
//! so a client never sees an entry before the response to its open.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use common::{EntryStream, ReadRange};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::proto::{FeedMsg, OpenFeedReq};
use crate::read_config::{derive_read_range, first_entry_id};
use crate::registry::{Feed, FeedRegistry};
use crate::response::{self, Responder};

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    range: ReadRange,
    first_entry_id: u64,
    ids_only: bool,
}

struct ReadStream {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamSession {
    id: u64,
    registry: Arc<FeedRegistry>,
    responder: Responder,
    feed: Option<Arc<Feed>>,
    cursor: Arc<AtomicU64>,
    pending: Option<PendingRead>,
    reader: Option<ReadStream>,
    // Parent of every reader token; cancelled when the session is closed.
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(id: u64, registry: Arc<FeedRegistry>, responder: Responder) -> Self {
        Self {
            id,
            registry,
            responder,
            feed: None,
            cursor: Arc::new(AtomicU64::new(0)),
            pending: None,
            reader: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn feed(&self) -> Option<&Arc<Feed>> {
        self.feed.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.feed.is_some()
    }

    /// Index the next delivered entry will carry.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Binds the session to the request's feed, writes the genesis entry if
    /// one is supplied, and prepares the read-stream.
    ///
    /// The reader only starts on [`activate`](Self::activate). If the
    /// genesis append fails the session stays bound but will not stream.
    pub async fn open(&mut self, request: &OpenFeedReq) -> Result<()> {
        if self.id == 0 {
            return Err(Error::InvalidSessionId);
        }
        let feed = self.registry.open(&request.feed_uri).await?;
        self.stop_reading().await;
        self.feed = Some(feed.clone());

        if let Some(genesis) = &request.genesis_entry {
            let index = self.append(genesis.msg_data.clone()).await?;
            tracing::debug!(
                "session {} wrote genesis entry {} to {}",
                self.id,
                index,
                feed.uri()
            );
        }

        self.configure(request, &feed);
        Ok(())
    }

    /// Re-opens an existing session: tears down the active read-stream,
    /// rebinds to the request's feed and prepares a new read-stream.
    /// Genesis entries are ignored on reset.
    pub async fn reset(&mut self, request: &OpenFeedReq) -> Result<()> {
        let feed = self.registry.open(&request.feed_uri).await?;
        self.stop_reading().await;
        self.feed = Some(feed.clone());
        self.configure(request, &feed);
        Ok(())
    }

    fn configure(&mut self, request: &OpenFeedReq, feed: &Feed) {
        self.pending = derive_read_range(request, feed.len()).map(|range| PendingRead {
            range,
            first_entry_id: first_entry_id(request, &range),
            ids_only: request.send_entry_ids_only,
        });
        match &self.pending {
            Some(pending) => tracing::debug!(
                "session {} will read {} with {:?}",
                self.id,
                feed.uri(),
                pending.range
            ),
            None => tracing::debug!("session {} bound to {} without streaming", self.id, feed.uri()),
        }
    }

    /// Starts the read-stream prepared by the last successful open or reset.
    pub fn activate(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let Some(feed) = self.feed.clone() else {
            return;
        };

        // A tail start was pinned to the feed length before the open was
        // answered; entries appended since then must still be delivered.
        let range = ReadRange {
            tail: false,
            ..pending.range
        };
        self.cursor.store(pending.first_entry_id, Ordering::SeqCst);

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(deliver(
            self.id,
            feed.read(range),
            self.cursor.clone(),
            pending.ids_only,
            self.responder.clone(),
            cancel.clone(),
        ));
        self.reader = Some(ReadStream { cancel, task });
    }

    pub async fn append(&self, data: Bytes) -> Result<u64> {
        let feed = self.feed.as_ref().ok_or(Error::NotWritable)?;
        let bytes = data.len() as u64;
        let index = feed.append(data).await?;
        let metrics = self.responder.metrics();
        metrics.entries_appended_total.inc();
        metrics.append_bytes_total.inc_by(bytes);
        Ok(index)
    }

    /// Stops streaming and releases the feed binding. The feed itself stays
    /// open in the registry.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.stop_reading().await;
        self.feed = None;
    }

    async fn stop_reading(&mut self) {
        self.pending = None;
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            if let Err(err) = reader.task.await
                && err.is_panic()
            {
                tracing::error!("read stream for session {} panicked", self.id);
            }
        }
    }
}

async fn deliver(
    session_id: u64,
    mut entries: EntryStream,
    cursor: Arc<AtomicU64>,
    ids_only: bool,
    responder: Responder,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = entries.next() => next,
        };

        let msg = match next {
            Some(Ok(entry)) => {
                let entry_id = cursor.fetch_add(1, Ordering::SeqCst);
                let data = if ids_only { Bytes::new() } else { entry.value };
                response::entry(session_id, entry_id, data)
            }
            Some(Err(err)) => {
                tracing::warn!("read stream for session {} failed: {}", session_id, err);
                let source = FeedMsg {
                    req_id: session_id,
                    feed_id: session_id,
                    ..Default::default()
                };
                let _ = responder
                    .outbound()
                    .send(response::discarded(&source, &Error::from(err)))
                    .await;
                break;
            }
            None => {
                tracing::debug!("read stream for session {} reached end of range", session_id);
                break;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = responder.outbound().send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        responder.metrics().entries_delivered_total.inc();
    }
}

pub(crate) enum Command {
    Open {
        request: FeedMsg,
        open: OpenFeedReq,
        seq: u64,
    },
    Append {
        request: FeedMsg,
        data: Bytes,
    },
    Close {
        request: Option<FeedMsg>,
    },
}

impl Command {
    /// The client request this command answers, if any.
    pub(crate) fn request(&self) -> Option<&FeedMsg> {
        match self {
            Command::Open { request, .. } | Command::Append { request, .. } => Some(request),
            Command::Close { request } => request.as_ref(),
        }
    }
}

/// Notifications from session actors back to their connection.
pub(crate) enum SessionEvent {
    /// Open number `seq` failed before a feed was bound. The session should
    /// leave the table unless a later open has been queued since.
    Unbound { id: u64, generation: u64, seq: u64 },
}

/// Connection-side handle to a running session actor.
pub(crate) struct SessionHandle {
    id: u64,
    generation: u64,
    opens: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn spawn(
        session: StreamSession,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let id = session.id;
        let cancel = session.cancel.clone();
        let task = tokio::spawn(run(session, rx, generation, events));
        Self {
            id,
            generation,
            opens: 0,
            commands,
            cancel,
            task,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Sequence number of the most recently queued open.
    pub(crate) fn last_open(&self) -> u64 {
        self.opens
    }

    /// Queues an open or reset. The command comes back if the actor has
    /// already stopped.
    pub(crate) fn open(
        &mut self,
        request: FeedMsg,
        open: OpenFeedReq,
    ) -> std::result::Result<(), Command> {
        self.opens += 1;
        self.send(Command::Open {
            request,
            open,
            seq: self.opens,
        })
    }

    /// Queues a command. The command comes back if the actor has already
    /// stopped, which happens once the connection's writer is gone.
    pub(crate) fn send(&self, command: Command) -> std::result::Result<(), Command> {
        self.commands.send(command).map_err(|err| err.0)
    }

    /// Closes the session on behalf of the client. Responses to commands
    /// still in flight are dropped; `request`, if any, is answered once the
    /// reader has stopped.
    pub(crate) fn close(self, request: Option<FeedMsg>) -> JoinHandle<()> {
        self.cancel.cancel();
        self.stop(Command::Close { request })
    }

    /// Closes the session after every queued command has been answered.
    pub(crate) fn retire(self) -> JoinHandle<()> {
        self.stop(Command::Close { request: None })
    }

    fn stop(self, command: Command) -> JoinHandle<()> {
        if self.send(command).is_err() {
            tracing::debug!("session {} already stopped", self.id);
        }
        self.task
    }
}

async fn run(
    mut session: StreamSession,
    mut commands: mpsc::UnboundedReceiver<Command>,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let id = session.id;
    let responder = session.responder.clone();
    let closed = session.cancel.clone();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Open { request, open, seq } => {
                let result = if session.is_bound() {
                    session.reset(&open).await
                } else {
                    session.open(&open).await
                };
                if closed.is_cancelled() {
                    tracing::debug!("session {} closed; dropping open response", id);
                    continue;
                }
                let opened = result.is_ok();
                if !responder.respond(&request, result.map(|()| 0)).await {
                    break;
                }
                if opened {
                    session.activate();
                } else if !session.is_bound() {
                    let _ = events.send(SessionEvent::Unbound {
                        id,
                        generation,
                        seq,
                    });
                }
            }
            Command::Append { request, data } => {
                let result = session.append(data).await;
                if closed.is_cancelled() {
                    tracing::debug!("session {} closed; dropping append response", id);
                    continue;
                }
                if !responder.respond(&request, result).await {
                    break;
                }
            }
            Command::Close { request } => {
                session.close().await;
                if let Some(request) = request {
                    responder.respond(&request, Ok(0)).await;
                }
                tracing::debug!("session {} closed", id);
                return;
            }
        }
    }
    session.close().await;
}

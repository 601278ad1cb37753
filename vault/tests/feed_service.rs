use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    FeedLog, FeedStorage, FileFeedStorage, FileStorageConfig, InMemoryFeedStorage, StorageError,
    StorageResult,
};
use futures::stream;
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vault::proto::{FeedMsg, FeedMsgOp, OpenFeedReq, ReqErr, StreamMode};
use vault::{Error, FeedConnection, FeedRegistry, Metrics};

const TIMEOUT: Duration = Duration::from_secs(2);

/// One client connection driven over in-process channels.
struct Client {
    inbound: mpsc::Sender<vault::Result<FeedMsg>>,
    outbound: mpsc::Receiver<FeedMsg>,
    task: JoinHandle<vault::Result<()>>,
}

impl Client {
    fn connect(registry: &Arc<FeedRegistry>, metrics: &Arc<Metrics>) -> Self {
        let (inbound, in_rx) = mpsc::channel(64);
        let (out_tx, outbound) = mpsc::channel(64);
        let frames = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        let connection = FeedConnection::new(registry.clone(), out_tx, metrics.clone());
        let task = tokio::spawn(connection.serve(frames, CancellationToken::new()));
        Self {
            inbound,
            outbound,
            task,
        }
    }

    async fn send(&self, msg: FeedMsg) {
        self.inbound.send(Ok(msg)).await.unwrap();
    }

    async fn recv(&mut self) -> FeedMsg {
        tokio::time::timeout(TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
    }

    /// Sends `msg` and returns the next message, which must answer it.
    async fn request(&mut self, msg: FeedMsg) -> FeedMsg {
        let req_id = msg.req_id;
        self.send(msg).await;
        let response = self.recv().await;
        assert_eq!(response.req_id, req_id, "unexpected message {:?}", response);
        response
    }

    async fn open(&mut self, req_id: u64, session: u64, request: OpenFeedReq) -> FeedMsg {
        self.request(FeedMsg::open(req_id, session, &request)).await
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.outbound.recv()).await;
        assert!(next.is_err(), "expected no message, got {:?}", next);
    }

    async fn disconnect(self) -> vault::Result<()> {
        drop(self.inbound);
        self.task.await.unwrap()
    }
}

struct Service {
    registry: Arc<FeedRegistry>,
    metrics: Arc<Metrics>,
}

impl Service {
    fn new(storage: Arc<dyn FeedStorage>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(FeedRegistry::new(storage, metrics.clone()));
        Self { registry, metrics }
    }

    fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryFeedStorage::new()))
    }

    fn connect(&self) -> Client {
        Client::connect(&self.registry, &self.metrics)
    }
}

fn assert_complete(msg: &FeedMsg, entry_id: u64) {
    assert_eq!(msg.op(), Some(FeedMsgOp::ReqComplete), "got {:?}", msg);
    assert_eq!(msg.entry_id, entry_id);
}

fn assert_discarded(msg: &FeedMsg, expected: &str) {
    assert_eq!(msg.op(), Some(FeedMsgOp::ReqDiscarded), "got {:?}", msg);
    let err = ReqErr::decode(msg.msg_data.clone()).unwrap();
    assert_eq!(err.msg, expected);
}

fn assert_entry(msg: &FeedMsg, session: u64, entry_id: u64, data: &str) {
    assert_eq!(msg.op(), Some(FeedMsgOp::RecvEntry), "got {:?}", msg);
    assert_eq!(msg.req_id, session);
    assert_eq!(msg.feed_id, session);
    assert_eq!(msg.entry_id, entry_id);
    assert_eq!(msg.msg_data, Bytes::from(data.to_string()));
}

#[tokio::test]
async fn should_stream_genesis_and_appended_entries_on_reopen() {
    // given - a feed created with a genesis entry and one append
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://genesis", StreamMode::DontStream).with_genesis("genesis");
    assert_complete(&client.open(1, 1, request).await, 0);
    assert_complete(&client.request(FeedMsg::append(2, 1, "test 1")).await, 1);
    assert_complete(&client.request(FeedMsg::cancel(3, 1)).await, 0);

    // when
    let request = OpenFeedReq::new("feed://genesis", StreamMode::FromGenesis);
    let response = client.open(4, 1, request).await;

    // then - the open response precedes every delivery
    assert_complete(&response, 0);
    assert_entry(&client.recv().await, 1, 0, "genesis");
    assert_entry(&client.recv().await, 1, 1, "test 1");
}

#[tokio::test]
async fn should_seek_to_entry_on_reopen_of_same_session() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://seek", StreamMode::DontStream);
    client.open(1, 1, request).await;
    for (req_id, data) in [(2, "test 1"), (3, "test 2"), (4, "test 3"), (5, "test 4")] {
        client.request(FeedMsg::append(req_id, 1, data)).await;
    }

    // when
    let request = OpenFeedReq::new("feed://seek", StreamMode::AtEntry).with_seek(2);
    let response = client.open(6, 1, request).await;

    // then
    assert_complete(&response, 0);
    assert_entry(&client.recv().await, 1, 2, "test 3");
    assert_entry(&client.recv().await, 1, 3, "test 4");
    client.expect_silence().await;
}

#[tokio::test]
async fn should_read_from_genesis_across_connections() {
    // given
    let service = Service::in_memory();
    let mut writer = service.connect();
    let mut reader = service.connect();
    writer
        .open(1, 1, OpenFeedReq::new("feed://cross", StreamMode::DontStream))
        .await;
    writer.request(FeedMsg::append(2, 1, "test 1")).await;
    writer.request(FeedMsg::append(3, 1, "test 2")).await;

    // when
    let response = reader
        .open(1, 1, OpenFeedReq::new("feed://cross", StreamMode::FromGenesis))
        .await;

    // then
    assert_complete(&response, 0);
    assert_entry(&reader.recv().await, 1, 0, "test 1");
    assert_entry(&reader.recv().await, 1, 1, "test 2");
    writer.expect_silence().await;
}

#[tokio::test]
async fn should_stop_bounded_stream_after_max_entries() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://bounded", StreamMode::DontStream);
    client.open(1, 1, request).await;
    for (req_id, data) in [(2, "a"), (3, "b"), (4, "c")] {
        client.request(FeedMsg::append(req_id, 1, data)).await;
    }

    // when
    let request = OpenFeedReq::new("feed://bounded", StreamMode::AtEntry)
        .with_seek(1)
        .with_max_entries(1);
    let response = client.open(5, 2, request).await;

    // then
    assert_complete(&response, 0);
    assert_entry(&client.recv().await, 2, 1, "b");
    client.expect_silence().await;
}

#[tokio::test]
async fn should_tail_entries_appended_by_another_client() {
    // given
    let service = Service::in_memory();
    let mut writer = service.connect();
    let mut reader = service.connect();
    writer
        .open(1, 7, OpenFeedReq::new("feed://shared", StreamMode::DontStream))
        .await;
    writer.request(FeedMsg::append(2, 7, "before")).await;
    let response = reader
        .open(1, 3, OpenFeedReq::new("feed://shared", StreamMode::AfterHead))
        .await;
    assert_complete(&response, 0);

    // when
    writer.request(FeedMsg::append(3, 7, "hello")).await;
    writer.request(FeedMsg::append(4, 7, "again")).await;

    // then - delivered IDs count from zero, not from the feed length
    assert_entry(&reader.recv().await, 3, 0, "hello");
    assert_entry(&reader.recv().await, 3, 1, "again");
    reader.expect_silence().await;
}

#[tokio::test]
async fn should_wait_for_bounded_entries_after_head() {
    // given
    let service = Service::in_memory();
    let mut writer = service.connect();
    let mut reader = service.connect();
    writer
        .open(1, 1, OpenFeedReq::new("feed://bounded-tail", StreamMode::DontStream))
        .await;
    writer.request(FeedMsg::append(2, 1, "old")).await;
    let request = OpenFeedReq::new("feed://bounded-tail", StreamMode::AfterHead).with_max_entries(2);
    assert_complete(&reader.open(1, 4, request).await, 0);

    // when
    for (req_id, data) in [(3, "x"), (4, "y"), (5, "z")] {
        writer.request(FeedMsg::append(req_id, 1, data)).await;
    }

    // then
    assert_entry(&reader.recv().await, 4, 0, "x");
    assert_entry(&reader.recv().await, 4, 1, "y");
    reader.expect_silence().await;
}

#[tokio::test]
async fn should_wait_for_bounded_entries_past_head() {
    // given - the bounded range asks for more entries than the feed holds
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://bounded-head", StreamMode::AtEntry)
        .with_genesis("g")
        .with_max_entries(3);
    assert_complete(&client.open(1, 1, request).await, 0);
    assert_entry(&client.recv().await, 1, 0, "g");

    // when
    client.send(FeedMsg::append(2, 1, "x")).await;
    client.send(FeedMsg::append(3, 1, "y")).await;
    let mut messages = Vec::new();
    for _ in 0..4 {
        messages.push(client.recv().await);
    }

    // then - appends are answered and the stream delivers up to its bound
    let entries: Vec<(u64, Bytes)> = messages
        .iter()
        .filter(|msg| msg.op() == Some(FeedMsgOp::RecvEntry))
        .map(|msg| (msg.entry_id, msg.msg_data.clone()))
        .collect();
    assert_eq!(
        entries,
        vec![(1, Bytes::from("x")), (2, Bytes::from("y"))]
    );
    client.request(FeedMsg::append(4, 1, "past bound")).await;
    client.expect_silence().await;
}

#[tokio::test]
async fn should_stream_nothing_with_dont_stream() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://quiet", StreamMode::DontStream).with_genesis("g");

    // when
    assert_complete(&client.open(1, 1, request).await, 0);
    assert_complete(&client.request(FeedMsg::append(2, 1, "x")).await, 1);

    // then
    client.expect_silence().await;
}

#[tokio::test]
async fn should_send_ids_without_data() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://ids", StreamMode::FromGenesis)
        .with_genesis("payload")
        .with_ids_only()
        .with_max_entries(1);

    // when
    client.open(1, 1, request).await;
    let entry = client.recv().await;

    // then
    assert_eq!(entry.op(), Some(FeedMsgOp::RecvEntry));
    assert_eq!(entry.entry_id, 0);
    assert!(entry.msg_data.is_empty());
}

#[tokio::test]
async fn should_reject_session_id_zero() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();

    // when
    let response = client
        .open(1, 0, OpenFeedReq::new("feed://zero", StreamMode::FromGenesis))
        .await;

    // then
    assert_discarded(&response, "invalid stream ID");
    assert!(service.registry.is_empty().await);
}

#[tokio::test]
async fn should_reject_unknown_operation() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let msg = FeedMsg {
        req_id: 4,
        feed_id: 1,
        msg_op: 42,
        ..Default::default()
    };

    // when
    let response = client.request(msg).await;

    // then
    assert_discarded(&response, "unsupported operation: 42");
    assert_eq!(response.feed_id, 1);
}

#[tokio::test]
async fn should_reject_requests_for_unopened_session() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();

    // when
    let append = client.request(FeedMsg::append(1, 9, "x")).await;
    let close = client.request(FeedMsg::cancel(2, 9)).await;

    // then
    assert_discarded(&append, "stream 9 is not open");
    assert_discarded(&close, "stream 9 is not open");
}

#[tokio::test]
async fn should_reject_close_of_closed_session() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    client
        .open(1, 1, OpenFeedReq::new("feed://c", StreamMode::DontStream))
        .await;
    assert_complete(&client.request(FeedMsg::cancel(2, 1)).await, 0);

    // when
    let response = client.request(FeedMsg::cancel(3, 1)).await;

    // then
    assert_discarded(&response, "stream 1 is not open");
}

#[tokio::test]
async fn should_reject_append_to_read_only_feed() {
    // given
    let service = Service::new(Arc::new(InMemoryFeedStorage::read_only()));
    let mut client = service.connect();
    let response = client
        .open(1, 1, OpenFeedReq::new("feed://ro", StreamMode::DontStream))
        .await;
    assert_complete(&response, 0);

    // when
    let response = client.request(FeedMsg::append(2, 1, "x")).await;

    // then
    assert_discarded(&response, "feed is not writable");
}

#[tokio::test]
async fn should_keep_session_bound_when_genesis_fails() {
    // given
    let service = Service::new(Arc::new(InMemoryFeedStorage::read_only()));
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://ro", StreamMode::FromGenesis).with_genesis("g");

    // when
    let open = client.open(1, 1, request).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let append = client.request(FeedMsg::append(2, 1, "x")).await;

    // then - the session still exists, so the failure is about the feed
    assert_discarded(&open, "feed is not writable");
    assert_discarded(&append, "feed is not writable");
    client.expect_silence().await;
}

#[tokio::test]
async fn should_answer_malformed_frames() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();

    // when
    client
        .inbound
        .send(Err(Error::Malformed("truncated frame".to_string())))
        .await
        .unwrap();
    let frame_response = client.recv().await;
    let bad_open = FeedMsg {
        req_id: 5,
        feed_id: 1,
        msg_op: FeedMsgOp::OpenFeed as i32,
        entry_id: 0,
        msg_data: Bytes::from_static(&[0xff, 0xff, 0xff]),
    };
    let open_response = client.request(bad_open).await;

    // then
    assert_eq!(frame_response.req_id, 0);
    assert_discarded(&frame_response, "malformed message: truncated frame");
    assert_eq!(open_response.op(), Some(FeedMsgOp::ReqDiscarded));
    assert_eq!(open_response.feed_id, 1);
}

#[tokio::test]
async fn should_stop_delivering_after_close() {
    // given
    let service = Service::in_memory();
    let mut reader = service.connect();
    let mut writer = service.connect();
    reader
        .open(1, 1, OpenFeedReq::new("feed://closing", StreamMode::AfterHead))
        .await;
    writer
        .open(1, 1, OpenFeedReq::new("feed://closing", StreamMode::DontStream))
        .await;

    // when
    assert_complete(&reader.request(FeedMsg::cancel(2, 1)).await, 0);
    writer.request(FeedMsg::append(2, 1, "unseen")).await;

    // then
    reader.expect_silence().await;
}

#[tokio::test]
async fn should_restart_stream_on_reopen_of_same_session() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://reset", StreamMode::DontStream);
    client.open(1, 1, request).await;
    for (req_id, data) in [(2, "a"), (3, "b"), (4, "c")] {
        client.request(FeedMsg::append(req_id, 1, data)).await;
    }

    // when
    let request = OpenFeedReq::new("feed://reset", StreamMode::AfterEntry)
        .with_seek(0)
        .with_max_entries(2);
    let response = client.open(5, 1, request).await;

    // then
    assert_complete(&response, 0);
    assert_entry(&client.recv().await, 1, 1, "b");
    assert_entry(&client.recv().await, 1, 2, "c");
    client.expect_silence().await;
}

#[tokio::test]
async fn should_keep_sessions_independent() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    client
        .open(1, 1, OpenFeedReq::new("feed://one", StreamMode::DontStream))
        .await;
    client
        .open(2, 2, OpenFeedReq::new("feed://two", StreamMode::DontStream))
        .await;

    // when
    let first = client.request(FeedMsg::append(3, 1, "x")).await;
    let second = client.request(FeedMsg::append(4, 2, "y")).await;
    client.request(FeedMsg::cancel(5, 1)).await;
    let after_close = client.request(FeedMsg::append(6, 2, "z")).await;

    // then
    assert_complete(&first, 0);
    assert_complete(&second, 0);
    assert_complete(&after_close, 1);
}

/// Storage whose opens always fail.
struct BrokenStorage;

#[async_trait]
impl FeedStorage for BrokenStorage {
    async fn open(&self, _uri: &str) -> StorageResult<Arc<dyn FeedLog>> {
        Err(StorageError::Storage("disk unavailable".to_string()))
    }
}

#[tokio::test]
async fn should_forget_session_whose_open_failed() {
    // given
    let service = Service::new(Arc::new(BrokenStorage));
    let mut client = service.connect();

    // when
    let open = client
        .open(1, 5, OpenFeedReq::new("feed://broken", StreamMode::AtEntry))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let append = client.request(FeedMsg::append(2, 5, "x")).await;

    // then
    assert_discarded(&open, "storage error: disk unavailable");
    assert_discarded(&append, "stream 5 is not open");
}

/// Storage that refuses to open URIs under `feed://bad`.
struct PickyStorage {
    inner: InMemoryFeedStorage,
}

#[async_trait]
impl FeedStorage for PickyStorage {
    async fn open(&self, uri: &str) -> StorageResult<Arc<dyn FeedLog>> {
        if uri.starts_with("feed://bad") {
            return Err(StorageError::Storage("disk unavailable".to_string()));
        }
        self.inner.open(uri).await
    }
}

#[tokio::test]
async fn should_keep_session_reopened_right_after_failed_open() {
    // given
    let service = Service::new(Arc::new(PickyStorage {
        inner: InMemoryFeedStorage::new(),
    }));
    let mut client = service.connect();

    // when - the second open is queued before the first one fails
    let bad = FeedMsg::open(1, 5, &OpenFeedReq::new("feed://bad", StreamMode::AtEntry));
    let good = FeedMsg::open(2, 5, &OpenFeedReq::new("feed://good", StreamMode::DontStream));
    client.send(bad).await;
    client.send(good).await;
    let first = client.recv().await;
    let second = client.recv().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let append = client.request(FeedMsg::append(3, 5, "x")).await;

    // then
    assert_discarded(&first, "storage error: disk unavailable");
    assert_eq!(second.req_id, 2);
    assert_complete(&second, 0);
    assert_complete(&append, 0);
}

#[tokio::test]
async fn should_end_connection_quietly_when_writer_is_gone() {
    // given
    let service = Service::in_memory();
    let Client {
        inbound,
        outbound,
        task,
    } = service.connect();
    drop(outbound);

    // when
    let open = OpenFeedReq::new("feed://gone", StreamMode::DontStream);
    let _ = inbound.send(Ok(FeedMsg::open(1, 1, &open))).await;
    let _ = inbound.send(Ok(FeedMsg::append(2, 1, "x"))).await;
    let result = tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("connection did not end")
        .unwrap();

    // then
    assert_eq!(result, Ok(()));
    let encoded = service.metrics.encode();
    assert!(encoded.contains("vault_sessions_active 0"));
    assert!(encoded.contains("vault_connections_active 0"));
}

#[tokio::test]
async fn should_close_sessions_when_client_disconnects() {
    // given
    let service = Service::in_memory();
    let mut client = service.connect();
    client
        .open(1, 1, OpenFeedReq::new("feed://bye", StreamMode::AfterHead))
        .await;
    client
        .open(2, 2, OpenFeedReq::new("feed://bye", StreamMode::DontStream))
        .await;

    // when
    let result = client.disconnect().await;

    // then
    assert!(result.is_ok());
    let encoded = service.metrics.encode();
    assert!(encoded.contains("vault_sessions_active 0"));
    assert!(encoded.contains("vault_connections_active 0"));
}

#[tokio::test]
async fn should_persist_feeds_through_close_sweep() {
    // given
    let tmp = tempfile::tempdir().unwrap();
    let config = FileStorageConfig {
        path: tmp.path().to_string_lossy().into_owned(),
        read_only: false,
        sync_writes: false,
    };
    let service = Service::new(Arc::new(FileFeedStorage::new(&config).unwrap()));
    let mut client = service.connect();
    let request = OpenFeedReq::new("feed://durable", StreamMode::DontStream).with_genesis("genesis");
    client.open(1, 1, request).await;
    client.request(FeedMsg::append(2, 1, "test 1")).await;
    client.disconnect().await.unwrap();

    // when
    let report = service.registry.close_all(Duration::from_secs(1)).await;

    // then
    assert_eq!(report.closed, 1);
    assert!(report.errors.is_empty());
    let restarted = Service::new(Arc::new(FileFeedStorage::new(&config).unwrap()));
    let mut client = restarted.connect();
    let request = OpenFeedReq::new("feed://durable", StreamMode::FromGenesis).with_max_entries(2);
    assert_complete(&client.open(1, 1, request).await, 0);
    assert_entry(&client.recv().await, 1, 0, "genesis");
    assert_entry(&client.recv().await, 1, 1, "test 1");
}

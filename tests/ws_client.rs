//! Integration tests for the WebSocket client against an in-memory connector.
//!
//! Every dial hands the test a [`ServerConn`]: the frames the client writes
//! on that connection, and a sender for frames the "server" pushes back.
//! Dropping the sender ends the client's stream, which looks like an
//! unexpected close.
//!
//! Run with:
//! ```bash
//! cargo test -p prime-sdk --test ws_client
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{sink, stream, FutureExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use prime_sdk::auth::Credentials;
use prime_sdk::error::WsError;
use prime_sdk::ws::transport::{Connector, DialerConfig, FrameSink, FrameStream};
use prime_sdk::ws::{
    Channel, ConnectionState, EventSink, InboundEvent, QueueSink, QueuedEvent, ReconnectPolicy,
    Scope, SubscriptionStatus, WsClient, WsConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

// ─── Mock connector ──────────────────────────────────────────────────────────

struct ServerConn {
    /// Frames written by the client on this connection.
    outbound: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the client. Drop to simulate a dropped socket.
    inbound: mpsc::UnboundedSender<Result<String, WsError>>,
}

struct MockConnector {
    dials: AtomicUsize,
    fail: AtomicBool,
    urls: Mutex<Vec<String>>,
    conns: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (conns, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            dials: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            urls: Mutex::new(Vec::new()),
            conns,
        });
        (connector, rx)
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn dial<'a>(
        &'a self,
        config: &'a DialerConfig,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(config.url.clone());
            // Long enough for concurrent callers to overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;

            if self.fail.load(Ordering::SeqCst) {
                return Err(WsError::DialFailure("connection refused".into()));
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<String, WsError>>();

            let frame_sink: FrameSink = Box::pin(sink::unfold(out_tx, |tx, frame: String| async move {
                tx.send(frame)
                    .map_err(|_| WsError::SendFailed("server gone".into()))?;
                Ok::<_, WsError>(tx)
            }));
            let frame_stream: FrameStream = Box::pin(stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));

            let _ = self.conns.send(ServerConn {
                outbound: out_rx,
                inbound: in_tx,
            });
            Ok((frame_sink, frame_stream))
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn test_config() -> WsConfig {
    WsConfig::default().with_reconnect(ReconnectPolicy {
        enabled: true,
        max_attempts: Some(3),
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    })
}

fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials::new("AK", "secret", "pp", "SVC", "P1"))
}

struct Harness {
    client: WsClient,
    connector: Arc<MockConnector>,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    events: mpsc::Receiver<QueuedEvent>,
}

fn harness_with(config: WsConfig) -> Harness {
    let (connector, conns) = MockConnector::new();
    let (queue, events) = QueueSink::new(1024);
    let client = WsClient::with_connector(credentials(), config, Arc::new(queue), connector.clone());
    Harness {
        client,
        connector,
        conns,
        events,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    timeout(TEST_TIMEOUT, conns.recv())
        .await
        .expect("timed out waiting for a dial")
        .expect("connector dropped")
}

async fn next_frame(conn: &mut ServerConn) -> Value {
    let text = timeout(TEST_TIMEOUT, conn.outbound.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("client closed the sink");
    serde_json::from_str(&text).expect("client wrote invalid JSON")
}

/// Frames written until the connection stays quiet for [`QUIET`].
async fn drain_frames(conn: &mut ServerConn) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(text)) = timeout(QUIET, conn.outbound.recv()).await {
        frames.push(serde_json::from_str(&text).expect("client wrote invalid JSON"));
    }
    frames
}

/// Wait for the next queued item matching the predicate, skipping others.
async fn next_matching(
    events: &mut mpsc::Receiver<QueuedEvent>,
    predicate: impl Fn(&QueuedEvent) -> bool,
) -> QueuedEvent {
    timeout(TEST_TIMEOUT, async {
        while let Some(item) = events.recv().await {
            if predicate(&item) {
                return item;
            }
        }
        panic!("event queue closed without a matching item");
    })
    .await
    .expect("timed out waiting for matching event")
}

async fn wait_for_state(client: &WsClient, state: ConnectionState) {
    timeout(TEST_TIMEOUT, async {
        while client.connection_state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for connection state");
}

fn subscribe_summary(frame: &Value) -> (String, Vec<String>) {
    assert_eq!(frame["type"], "subscribe", "not a subscribe frame: {frame}");
    let ids = frame["product_ids"]
        .as_array()
        .map(|ids| ids.iter().map(|v| v.as_str().unwrap().to_string()).collect())
        .unwrap_or_default();
    (frame["channel"].as_str().unwrap().to_string(), ids)
}

fn is_unsubscribe(frame: &Value, channel: &str) -> bool {
    frame["type"] == "unsubscribe" && frame["channels"] == serde_json::json!([channel])
}

fn orders_frame(seq: u64) -> Result<String, WsError> {
    Ok(format!(
        r#"{{"channel":"orders","timestamp":"2024-01-01T00:00:00Z","sequence_num":{},"events":[{{"type":"update","orders":[]}}]}}"#,
        seq
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_connect_dials_once() {
    let mut h = harness();

    let (a, b) = tokio::join!(h.client.connect(), h.client.connect());
    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));
    assert_eq!(h.connector.dials(), 1);
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);

    // Already connected: no new dial.
    h.client.connect().await.unwrap();
    assert_eq!(h.connector.dials(), 1);

    let _conn = next_conn(&mut h.conns).await;
    assert_eq!(
        next_matching(&mut h.events, |e| matches!(e, QueuedEvent::State(_))).await,
        QueuedEvent::State(ConnectionState::Connecting)
    );
    assert_eq!(
        next_matching(&mut h.events, |e| matches!(e, QueuedEvent::State(_))).await,
        QueuedEvent::State(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn subscribe_writes_signed_frame() {
    let mut h = harness();
    h.client
        .subscribe(Channel::Level2, Scope::products(["BTC-USD", "ETH-USD"]))
        .await
        .unwrap();

    let mut conn = next_conn(&mut h.conns).await;
    let frame = next_frame(&mut conn).await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["channel"], "l2_data");
    assert_eq!(frame["access_key"], "AK");
    assert_eq!(frame["api_key_id"], "SVC");
    assert_eq!(frame["passphrase"], "pp");
    assert_eq!(frame["portfolio_id"], "P1");
    assert_eq!(frame["product_ids"], serde_json::json!(["BTC-USD", "ETH-USD"]));

    let timestamp = frame["timestamp"].as_str().unwrap();
    let expected = prime_sdk::auth::sign_stream(
        "l2_data",
        "P1",
        "SVC",
        timestamp,
        "AK",
        "secret",
        &["BTC-USD", "ETH-USD"],
    );
    assert_eq!(frame["signature"], expected);

    // Derived heartbeat subscription follows.
    let heartbeat = next_frame(&mut conn).await;
    assert_eq!(
        subscribe_summary(&heartbeat),
        ("heartbeats".to_string(), vec!["BTC-USD".to_string(), "ETH-USD".to_string()])
    );
}

#[tokio::test]
async fn same_scope_twice_sends_nothing() {
    let mut h = harness();
    h.client
        .subscribe(Channel::Level2, Scope::products(["BTC-USD", "ETH-USD"]))
        .await
        .unwrap();
    let mut conn = next_conn(&mut h.conns).await;
    assert_eq!(drain_frames(&mut conn).await.len(), 2);

    h.client
        .subscribe(Channel::Level2, Scope::products(["ETH-USD", "BTC-USD"]))
        .await
        .unwrap();
    assert!(drain_frames(&mut conn).await.is_empty());
}

#[tokio::test]
async fn scope_conflict_leaves_original_subscription() {
    let mut h = harness();
    h.client.subscribe(Channel::Orders, Scope::portfolio("A")).await.unwrap();

    let result = h.client.subscribe(Channel::Orders, Scope::portfolio("B")).await;
    assert_eq!(
        result,
        Err(WsError::ScopeConflict {
            channel: "orders".into()
        })
    );

    let subs = h.client.subscriptions().await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].channel, Channel::Orders);
    assert_eq!(subs[0].scope, Scope::portfolio("A"));

    let mut conn = next_conn(&mut h.conns).await;
    let frames = drain_frames(&mut conn).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["portfolio_id"], "A");
}

#[tokio::test]
async fn unsubscribe_inactive_channel_is_silent() {
    let mut h = harness();
    h.client.connect().await.unwrap();
    let mut conn = next_conn(&mut h.conns).await;

    assert_eq!(h.client.unsubscribe(Channel::Level2).await, Ok(()));
    assert_eq!(h.client.unsubscribe(Channel::Orders).await, Ok(()));
    assert!(drain_frames(&mut conn).await.is_empty());
}

#[tokio::test]
async fn heartbeat_scope_tracks_union() {
    let mut h = harness();
    h.client
        .subscribe_orders("P1", vec!["ETH-USD".into()])
        .await
        .unwrap();
    h.client
        .subscribe_level2(vec!["BTC-USD".into()])
        .await
        .unwrap();
    assert_eq!(h.client.heartbeat_scope().await, vec!["BTC-USD", "ETH-USD"]);

    let mut conn = next_conn(&mut h.conns).await;
    let frames = drain_frames(&mut conn).await;
    assert_eq!(frames.len(), 5);
    assert_eq!(
        subscribe_summary(&frames[0]),
        ("orders".to_string(), vec!["ETH-USD".to_string()])
    );
    assert_eq!(
        subscribe_summary(&frames[1]),
        ("heartbeats".to_string(), vec!["ETH-USD".to_string()])
    );
    assert_eq!(
        subscribe_summary(&frames[2]),
        ("l2_data".to_string(), vec!["BTC-USD".to_string()])
    );
    // Scope changes are unsubscribe then subscribe.
    assert!(is_unsubscribe(&frames[3], "heartbeats"));
    assert_eq!(
        subscribe_summary(&frames[4]),
        ("heartbeats".to_string(), vec!["BTC-USD".to_string(), "ETH-USD".to_string()])
    );

    h.client.unsubscribe(Channel::Level2).await.unwrap();
    assert_eq!(h.client.heartbeat_scope().await, vec!["ETH-USD"]);
    let frames = drain_frames(&mut conn).await;
    assert_eq!(frames.len(), 3);
    assert!(is_unsubscribe(&frames[0], "l2_data"));
    assert!(is_unsubscribe(&frames[1], "heartbeats"));
    assert_eq!(
        subscribe_summary(&frames[2]),
        ("heartbeats".to_string(), vec!["ETH-USD".to_string()])
    );

    h.client.unsubscribe(Channel::Orders).await.unwrap();
    assert!(h.client.heartbeat_scope().await.is_empty());
    let frames = drain_frames(&mut conn).await;
    assert_eq!(frames.len(), 2);
    assert!(is_unsubscribe(&frames[0], "orders"));
    assert!(is_unsubscribe(&frames[1], "heartbeats"));
}

#[tokio::test]
async fn reconnect_resubscribes_each_channel_once() {
    let mut h = harness();
    h.client.subscribe(Channel::Orders, Scope::portfolio("P1")).await.unwrap();
    h.client
        .subscribe(Channel::Level2, Scope::products(["BTC-USD"]))
        .await
        .unwrap();

    let mut first = next_conn(&mut h.conns).await;
    let initial: Vec<_> = drain_frames(&mut first)
        .await
        .iter()
        .map(subscribe_summary)
        .collect();
    assert_eq!(
        initial,
        vec![
            ("orders".to_string(), vec![]),
            ("l2_data".to_string(), vec!["BTC-USD".to_string()]),
            ("heartbeats".to_string(), vec!["BTC-USD".to_string()]),
        ]
    );

    // Unexpected close.
    drop(first);

    next_matching(&mut h.events, |e| {
        matches!(e, QueuedEvent::Error(WsError::ConnectionLost { .. }))
    })
    .await;

    let mut second = next_conn(&mut h.conns).await;
    let frames = drain_frames(&mut second).await;
    let resent: Vec<_> = frames.iter().map(subscribe_summary).collect();
    assert_eq!(resent, initial);
    assert_eq!(frames[0]["portfolio_id"], "P1");

    wait_for_state(&h.client, ConnectionState::Connected).await;
    assert_eq!(h.connector.dials(), 2);

    let subs = h.client.subscriptions().await;
    assert_eq!(subs.len(), 2);
    assert!(subs.iter().all(|s| s.status == SubscriptionStatus::Pending));
}

#[tokio::test]
async fn sequence_gap_surfaced_and_event_delivered() {
    let mut h = harness();
    h.client.subscribe(Channel::Orders, Scope::portfolio("P1")).await.unwrap();
    let conn = next_conn(&mut h.conns).await;

    for seq in [1, 2, 4] {
        conn.inbound.send(orders_frame(seq)).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(
            next_matching(&mut h.events, |e| !matches!(e, QueuedEvent::State(_))).await,
        );
    }

    let seqs: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            QueuedEvent::Event(InboundEvent::Orders(m)) => Some(m.sequence_num),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, vec![1, 2, 4]);
    assert_eq!(
        seen[2],
        QueuedEvent::Error(WsError::SequenceGap {
            channel: "orders".into(),
            expected: 3,
            received: 4,
        })
    );

    // Still connected: a gap does not tear the connection down.
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn ack_mismatch_degrades_subscription() {
    let mut h = harness();
    h.client
        .subscribe(Channel::Level2, Scope::products(["BTC-USD"]))
        .await
        .unwrap();
    let conn = next_conn(&mut h.conns).await;

    conn.inbound
        .send(Ok(r#"{"channel":"subscriptions","timestamp":"t","sequence_num":1,
            "events":[{"subscriptions":{"l2_data":["ETH-USD"]}}]}"#
            .to_string()))
        .unwrap();

    let err = next_matching(&mut h.events, |e| matches!(e, QueuedEvent::Error(_))).await;
    assert_eq!(
        err,
        QueuedEvent::Error(WsError::AckMismatch {
            channel: "l2_data".into(),
            expected: vec!["BTC-USD".into()],
            acknowledged: vec!["ETH-USD".into()],
        })
    );
    // The ack itself is still delivered.
    next_matching(&mut h.events, |e| {
        matches!(e, QueuedEvent::Event(InboundEvent::Subscriptions(_)))
    })
    .await;

    let subs = h.client.subscriptions().await;
    assert_eq!(subs[0].status, SubscriptionStatus::Degraded);

    conn.inbound
        .send(Ok(r#"{"channel":"subscriptions","timestamp":"t","sequence_num":2,
            "events":[{"subscriptions":{"l2_data":["BTC-USD"],"heartbeats":["BTC-USD"]}}]}"#
            .to_string()))
        .unwrap();
    next_matching(&mut h.events, |e| {
        matches!(e, QueuedEvent::Event(InboundEvent::Subscriptions(m)) if m.sequence_num == 2)
    })
    .await;
    assert_eq!(
        h.client.subscriptions().await[0].status,
        SubscriptionStatus::Confirmed
    );
}

#[tokio::test]
async fn unknown_frame_does_not_stop_reader() {
    let mut h = harness();
    h.client.connect().await.unwrap();
    let conn = next_conn(&mut h.conns).await;

    conn.inbound.send(Ok("{not json".to_string())).unwrap();
    conn.inbound.send(orders_frame(1)).unwrap();

    let err = next_matching(&mut h.events, |e| !matches!(e, QueuedEvent::State(_))).await;
    assert!(matches!(err, QueuedEvent::Error(WsError::UnknownFrame(_))));
    let event = next_matching(&mut h.events, |e| !matches!(e, QueuedEvent::State(_))).await;
    assert!(matches!(event, QueuedEvent::Event(InboundEvent::Orders(_))));
}

#[tokio::test]
async fn close_is_terminal() {
    let mut h = harness();
    h.client.subscribe(Channel::Orders, Scope::portfolio("P1")).await.unwrap();
    let conn = next_conn(&mut h.conns).await;

    h.client.close().await;
    assert_eq!(h.client.connection_state(), ConnectionState::Closed);
    drop(conn);

    tokio::time::sleep(QUIET).await;
    assert_eq!(h.connector.dials(), 1);
    assert_eq!(
        h.client.subscribe(Channel::Level2, Scope::products(["BTC-USD"])).await,
        Err(WsError::Closed)
    );
    assert_eq!(h.client.connect().await, Err(WsError::Closed));
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let mut h = harness();
    h.client.connect().await.unwrap();
    let conn = next_conn(&mut h.conns).await;

    h.connector.fail.store(true, Ordering::SeqCst);
    drop(conn);

    let exhausted = next_matching(&mut h.events, |e| {
        matches!(e, QueuedEvent::Error(WsError::ReconnectExhausted { .. }))
    })
    .await;
    assert_eq!(
        exhausted,
        QueuedEvent::Error(WsError::ReconnectExhausted { attempts: 3 })
    );
    assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.connector.dials(), 4);

    // A later explicit connect still works.
    h.connector.fail.store(false, Ordering::SeqCst);
    h.client.connect().await.unwrap();
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn no_reconnect_when_disabled() {
    let mut h = harness_with(WsConfig::default().with_reconnect(ReconnectPolicy::disabled()));
    h.client.connect().await.unwrap();
    drop(next_conn(&mut h.conns).await);

    wait_for_state(&h.client, ConnectionState::Disconnected).await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(h.connector.dials(), 1);
}

#[tokio::test]
async fn dial_failure_is_returned() {
    let h = harness();
    h.connector.fail.store(true, Ordering::SeqCst);

    let result = h.client.subscribe(Channel::Orders, Scope::portfolio("P1")).await;
    assert!(matches!(result, Err(WsError::DialFailure(_))));
    assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    assert!(h.client.subscriptions().await.is_empty());
}

#[tokio::test]
async fn set_url_reconnects_and_resubscribes() {
    let mut h = harness();
    h.client
        .subscribe(Channel::Level2, Scope::products(["BTC-USD"]))
        .await
        .unwrap();
    let mut first = next_conn(&mut h.conns).await;
    drain_frames(&mut first).await;

    h.client.set_url("wss://feed.example.test").await.unwrap();
    assert_eq!(h.client.url().await, "wss://feed.example.test");
    assert_eq!(h.connector.dials(), 2);
    assert_eq!(
        h.connector.urls.lock().unwrap().last().map(String::as_str),
        Some("wss://feed.example.test")
    );

    let mut second = next_conn(&mut h.conns).await;
    let resent: Vec<_> = drain_frames(&mut second)
        .await
        .iter()
        .map(subscribe_summary)
        .collect();
    assert_eq!(
        resent,
        vec![
            ("l2_data".to_string(), vec!["BTC-USD".to_string()]),
            ("heartbeats".to_string(), vec!["BTC-USD".to_string()]),
        ]
    );

    // The old connection's end must not trigger a reconnect of its own.
    drop(first);
    tokio::time::sleep(QUIET).await;
    assert_eq!(h.connector.dials(), 2);
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn failed_write_reconnects_and_keeps_subscription() {
    let mut h = harness();
    h.client.connect().await.unwrap();

    // The server stops reading but never closes its side.
    let ServerConn { outbound, inbound } = next_conn(&mut h.conns).await;
    drop(outbound);

    h.client
        .subscribe_orders("P1", vec!["BTC-USD".into()])
        .await
        .unwrap();

    let lost = next_matching(&mut h.events, |e| matches!(e, QueuedEvent::Error(_))).await;
    assert!(matches!(lost, QueuedEvent::Error(WsError::ConnectionLost { .. })));

    let mut second = next_conn(&mut h.conns).await;
    let resent: Vec<_> = drain_frames(&mut second)
        .await
        .iter()
        .map(subscribe_summary)
        .collect();
    assert_eq!(
        resent,
        vec![
            ("orders".to_string(), vec!["BTC-USD".to_string()]),
            ("heartbeats".to_string(), vec!["BTC-USD".to_string()]),
        ]
    );

    wait_for_state(&h.client, ConnectionState::Connected).await;
    assert_eq!(h.connector.dials(), 2);
    assert_eq!(h.client.subscriptions().await.len(), 1);
    drop(inbound);
}

#[tokio::test]
async fn silent_connection_is_replaced() {
    let mut h = harness_with(test_config().with_idle_timeout(Some(Duration::from_millis(100))));
    h.client.subscribe_level2(vec!["BTC-USD".into()]).await.unwrap();

    // Keep the first connection open but send nothing on it.
    let mut first = next_conn(&mut h.conns).await;
    assert_eq!(drain_frames(&mut first).await.len(), 2);

    let lost = next_matching(&mut h.events, |e| matches!(e, QueuedEvent::Error(_))).await;
    match lost {
        QueuedEvent::Error(WsError::ConnectionLost { reason, .. }) => {
            assert!(reason.contains("No frames"), "unexpected reason: {reason}")
        }
        other => panic!("expected ConnectionLost, got {other:?}"),
    }

    let mut second = next_conn(&mut h.conns).await;
    let resent: Vec<_> = drain_frames(&mut second)
        .await
        .iter()
        .map(subscribe_summary)
        .collect();
    assert_eq!(
        resent,
        vec![
            ("l2_data".to_string(), vec!["BTC-USD".to_string()]),
            ("heartbeats".to_string(), vec!["BTC-USD".to_string()]),
        ]
    );
    assert!(h.connector.dials() >= 2);
}

#[tokio::test]
async fn quiet_connection_without_heartbeats_stays_open() {
    let mut h = harness_with(test_config().with_idle_timeout(Some(Duration::from_millis(50))));
    h.client.connect().await.unwrap();
    let _conn = next_conn(&mut h.conns).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.connector.dials(), 1);
    assert!(h.client.is_connected());
}

#[tokio::test]
async fn sequence_numbers_restart_on_new_connection() {
    let mut h = harness();
    h.client.subscribe(Channel::Orders, Scope::portfolio("P1")).await.unwrap();
    let first = next_conn(&mut h.conns).await;

    for seq in [1, 2, 3] {
        first.inbound.send(orders_frame(seq)).unwrap();
    }
    for expected in [1, 2, 3] {
        let event = next_matching(&mut h.events, |e| !matches!(e, QueuedEvent::State(_))).await;
        assert!(
            matches!(&event, QueuedEvent::Event(InboundEvent::Orders(m)) if m.sequence_num == expected),
            "unexpected event: {event:?}"
        );
    }

    drop(first);
    next_matching(&mut h.events, |e| {
        matches!(e, QueuedEvent::Error(WsError::ConnectionLost { .. }))
    })
    .await;

    let second = next_conn(&mut h.conns).await;
    second.inbound.send(orders_frame(1)).unwrap();

    // Delivered as the first frame of a new connection: no gap, not stale.
    let event = next_matching(&mut h.events, |e| !matches!(e, QueuedEvent::State(_))).await;
    assert!(
        matches!(&event, QueuedEvent::Event(InboundEvent::Orders(m)) if m.sequence_num == 1),
        "unexpected event: {event:?}"
    );
}

/// Checks from inside each callback whether the client lock is free.
#[derive(Default)]
struct ReentrantSink {
    client: OnceLock<Weak<WsClient>>,
    lock_free: Mutex<Vec<(ConnectionState, bool)>>,
}

impl EventSink for ReentrantSink {
    fn on_state_change(&self, state: ConnectionState) {
        let Some(client) = self.client.get().and_then(Weak::upgrade) else {
            return;
        };
        let free = client.subscriptions().now_or_never().is_some();
        self.lock_free.lock().unwrap().push((state, free));
    }
}

#[tokio::test]
async fn sink_callbacks_run_without_client_lock() {
    let (connector, mut conns) = MockConnector::new();
    let sink = Arc::new(ReentrantSink::default());
    let client = Arc::new(WsClient::with_connector(
        credentials(),
        test_config(),
        sink.clone(),
        connector.clone(),
    ));
    let _ = sink.client.set(Arc::downgrade(&client));

    client.subscribe(Channel::Orders, Scope::portfolio("P1")).await.unwrap();
    let first = next_conn(&mut conns).await;

    // Reconnect runs on the reader task.
    drop(first);
    let _second = next_conn(&mut conns).await;
    wait_for_state(&client, ConnectionState::Connected).await;
    tokio::time::sleep(QUIET).await;

    let seen = sink.lock_free.lock().unwrap().clone();
    assert_eq!(
        seen.iter().map(|(state, _)| *state).collect::<Vec<_>>(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(seen.iter().all(|(_, free)| *free), "callback ran under the lock: {seen:?}");
}

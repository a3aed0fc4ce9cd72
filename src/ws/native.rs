//! Native WebSocket client — `tokio-tungstenite`.
//!
//! - One lock guards the connection and the subscription registry; connect,
//!   subscribe, unsubscribe, close and the reader's close handler all take it
//! - Sink callbacks never run under the lock: state changes and connection
//!   errors raised while it is held are queued and delivered after release
//! - One reader task per connection decodes frames and calls the
//!   [`EventSink`]; it also drops connections that go silent while
//!   heartbeats are subscribed
//! - A failed read or write drops the socket and starts exponential backoff
//!   reconnection with full jitter, then every active subscription (and the
//!   derived heartbeat scope) is re-sent with a fresh signature
//! - `close()` is terminal

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Credentials;
use crate::error::WsError;
use crate::ws::dispatch::{Dispatcher, EventSink};
use crate::ws::heartbeat::HeartbeatAction;
use crate::ws::messages::{InboundEvent, MessageOut, SubscribeFrame, UnsubscribeFrame};
use crate::ws::subscriptions::{ActiveSubscription, Admission, Channel, Scope, SubscriptionRegistry};
use crate::ws::transport::{Connector, DialerConfig, FrameSink, FrameStream, TungsteniteConnector};
use crate::ws::{ConnectionState, ReconnectPolicy, WsConfig};

/// Upper bound on flushing the close frame during `close()` / `set_url()`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ─── Connection + shared state ───────────────────────────────────────────────

/// One live socket. Replaced, never repaired, on reconnect.
struct Connection {
    sink: FrameSink,
    reader: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

/// Sink notification raised under the lock.
enum Notice {
    State(ConnectionState),
    Error(WsError),
}

struct Inner {
    dialer: DialerConfig,
    closed: bool,
    /// Bumped for every new connection and on close; a reader only acts on
    /// its own connection's loss.
    generation: u64,
    connection: Option<Connection>,
    /// Task currently running the reconnect loop, if any.
    recovery: Option<JoinHandle<()>>,
    registry: SubscriptionRegistry,
    notices: Vec<Notice>,
}

struct Shared {
    credentials: Arc<Credentials>,
    reconnect: ReconnectPolicy,
    idle_timeout: Option<Duration>,
    sink: Arc<dyn EventSink>,
    connector: Arc<dyn Connector>,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Update the state now; the sink hears about it on [`release`](Self::release).
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        let prev = self.state.swap(state as u8, Ordering::SeqCst);
        if prev != state as u8 {
            tracing::debug!("Connection state: {:?} -> {:?}", ConnectionState::from(prev), state);
            inner.notices.push(Notice::State(state));
        }
    }

    /// Unlock, then deliver everything queued while the lock was held.
    fn release(&self, mut inner: MutexGuard<'_, Inner>) {
        let notices = std::mem::take(&mut inner.notices);
        drop(inner);
        for notice in notices {
            match notice {
                Notice::State(state) => self.sink.on_state_change(state),
                Notice::Error(err) => self.sink.on_error(&err),
            }
        }
    }

    /// Dial if there is no live connection, then restore every subscription.
    ///
    /// Callers hold the lock, so concurrent callers collapse into one dial.
    async fn ensure_connected(self: &Arc<Self>, inner: &mut Inner) -> Result<(), WsError> {
        if inner.closed {
            return Err(WsError::Closed);
        }
        if inner.connection.is_some() {
            return Ok(());
        }

        self.set_state(inner, ConnectionState::Connecting);
        tracing::info!("Connecting to {}", inner.dialer.url);

        let (mut sink, stream) = match self.connector.dial(&inner.dialer).await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("WebSocket dial failed: {}", e);
                self.set_state(inner, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        inner.registry.mark_all_pending();
        if let Err(e) = resubscribe_all(&self.credentials, &mut inner.registry, &mut sink).await {
            tracing::warn!("Resubscribe failed on fresh connection: {}", e);
            self.set_state(inner, ConnectionState::Disconnected);
            return Err(e);
        }

        inner.generation += 1;
        let reader = spawn_reader(Arc::downgrade(self), stream, inner.generation);
        inner.connection = Some(Connection {
            sink,
            reader: Some(reader),
        });
        self.set_state(inner, ConnectionState::Connected);
        tracing::info!("WebSocket connected (generation {})", inner.generation);
        Ok(())
    }

    /// Write one frame. A retryable failure drops the connection and starts
    /// the reconnect loop before the error is returned.
    async fn write(self: &Arc<Self>, inner: &mut Inner, msg: &MessageOut) -> Result<(), WsError> {
        let connection = inner.connection.as_mut().ok_or(WsError::NotConnected)?;
        let result = send_msg(&mut connection.sink, msg).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.write_failed(inner, e);
            }
        }
        result
    }

    fn write_failed(self: &Arc<Self>, inner: &mut Inner, err: &WsError) {
        let reason = WsError::ConnectionLost {
            code: None,
            reason: err.to_string(),
        };
        if let Some(reader) = self.drop_connection(inner, reason) {
            reader.abort();
        }
        if self.reconnect.enabled && inner.recovery.is_none() {
            inner.recovery = Some(spawn_recovery(Arc::downgrade(self), self.reconnect.clone()));
        }
    }

    /// Forget a failed socket and report why. Returns its reader task so the
    /// caller decides whether it keeps running.
    fn drop_connection(&self, inner: &mut Inner, reason: WsError) -> Option<JoinHandle<()>> {
        inner.generation += 1;
        let reader = inner
            .connection
            .take()
            .and_then(|mut connection| connection.reader.take());
        tracing::warn!("WebSocket connection lost: {}", reason);
        self.set_state(inner, ConnectionState::Disconnected);
        inner.notices.push(Notice::Error(reason));
        reader
    }

    /// Bring the heartbeat subscription in line with the active channels.
    ///
    /// The coordinator is updated even while disconnected; the next
    /// connection picks up its scope.
    async fn sync_heartbeats(self: &Arc<Self>, inner: &mut Inner) -> Result<(), WsError> {
        let required = inner.registry.required_heartbeat_scope();
        let actions = inner.registry.heartbeats_mut().plan(required);
        for action in actions {
            if inner.connection.is_none() {
                break;
            }
            let msg = heartbeat_message(&self.credentials, action);
            match self.write(inner, &msg).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Heartbeat update not written: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop the current socket without touching the registry.
    async fn teardown(&self, inner: &mut Inner) {
        inner.generation += 1;
        if let Some(mut connection) = inner.connection.take() {
            if let Some(handle) = connection.reader.take() {
                handle.abort();
            }
            if tokio::time::timeout(CLOSE_TIMEOUT, connection.sink.close())
                .await
                .is_err()
            {
                tracing::debug!("Close frame not flushed within {:?}", CLOSE_TIMEOUT);
            }
        }
    }

    async fn add_subscription(
        self: &Arc<Self>,
        inner: &mut Inner,
        channel: Channel,
        scope: Scope,
    ) -> Result<(), WsError> {
        if inner.closed {
            return Err(WsError::Closed);
        }
        if inner.registry.admit(channel, &scope)? == Admission::AlreadyActive {
            tracing::debug!("Already subscribed to {} with this scope", channel);
            return Ok(());
        }

        self.ensure_connected(inner).await?;

        let frame = SubscribeFrame::for_scope(&self.credentials, channel, &scope, Utc::now());
        match self.write(inner, &MessageOut::Subscribe(frame)).await {
            Ok(()) => tracing::info!("Subscribed to {} ({:?})", channel, scope),
            Err(e) if e.is_retryable() => {
                tracing::warn!("Subscribe to {} will be sent after reconnect: {}", channel, e)
            }
            Err(e) => return Err(e),
        }

        inner.registry.insert(channel, scope);
        self.sync_heartbeats(inner).await
    }

    async fn remove_subscription(
        self: &Arc<Self>,
        inner: &mut Inner,
        channel: Channel,
    ) -> Result<(), WsError> {
        if inner.closed {
            return Err(WsError::Closed);
        }
        if channel == Channel::Heartbeats {
            return Err(WsError::InvalidScope {
                channel: channel.to_string(),
                reason: "heartbeat membership is derived".to_string(),
            });
        }
        if inner.registry.remove(channel).is_none() {
            tracing::debug!("Unsubscribe from inactive channel {} ignored", channel);
            return Ok(());
        }

        if inner.connection.is_some() {
            let msg = MessageOut::Unsubscribe(UnsubscribeFrame::new(channel));
            if let Err(e) = self.write(inner, &msg).await {
                tracing::warn!("Unsubscribe from {} not written: {}", channel, e);
            }
        }
        tracing::info!("Unsubscribed from {}", channel);

        if let Err(e) = self.sync_heartbeats(inner).await {
            tracing::warn!("Heartbeat update not written: {}", e);
        }
        Ok(())
    }

    async fn switch_url(self: &Arc<Self>, inner: &mut Inner, url: String) -> Result<(), WsError> {
        if inner.closed {
            return Err(WsError::Closed);
        }
        inner.dialer.url = url;
        if inner.connection.is_none() {
            return Ok(());
        }

        tracing::info!("URL changed, reconnecting to {}", inner.dialer.url);
        self.teardown(inner).await;
        self.set_state(inner, ConnectionState::Disconnected);
        self.ensure_connected(inner).await
    }

    async fn shutdown(&self, inner: &mut Inner) {
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(handle) = inner.recovery.take() {
            handle.abort();
        }
        self.teardown(inner).await;
        self.set_state(inner, ConnectionState::Closed);
        tracing::info!("WebSocket client closed");
    }
}

// ─── Public WsClient ─────────────────────────────────────────────────────────

/// Authenticated subscription client for the real-time feed.
///
/// Connects lazily on the first subscribe (or explicitly with
/// [`connect`](Self::connect)). Events are delivered to the [`EventSink`]
/// passed at construction; see [`dispatch`](crate::ws::dispatch) for the
/// backpressure contract.
///
/// Share between tasks with `Arc<WsClient>`. Dropping the client releases
/// the reader task and the socket.
pub struct WsClient {
    shared: Arc<Shared>,
}

impl WsClient {
    /// Create a client using `tokio-tungstenite`. Does not connect yet.
    pub fn new(credentials: Arc<Credentials>, config: WsConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_connector(credentials, config, sink, Arc::new(TungsteniteConnector))
    }

    /// Create a client that dials through `connector`.
    pub fn with_connector(
        credentials: Arc<Credentials>,
        config: WsConfig,
        sink: Arc<dyn EventSink>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let WsConfig {
            dialer,
            reconnect,
            idle_timeout,
        } = config;
        Self {
            shared: Arc::new(Shared {
                credentials,
                reconnect,
                idle_timeout,
                sink,
                connector,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                inner: Mutex::new(Inner {
                    dialer,
                    closed: false,
                    generation: 0,
                    connection: None,
                    recovery: None,
                    registry: SubscriptionRegistry::new(),
                    notices: Vec::new(),
                }),
            }),
        }
    }

    /// Open the connection if it is not already open.
    ///
    /// Returns immediately when connected. Otherwise dials within the
    /// configured timeout and restores any recorded subscriptions.
    pub async fn connect(&self) -> Result<(), WsError> {
        let mut inner = self.shared.inner.lock().await;
        let result = self.shared.ensure_connected(&mut inner).await;
        self.shared.release(inner);
        result
    }

    /// Subscribe `channel` to `scope`.
    ///
    /// Resolves once the frame is written, not when the server acks it. Ack
    /// disagreements arrive later through [`EventSink::on_error`]. If the
    /// write fails the connection is dropped, the subscription stays
    /// recorded, and it is sent again on the next connection.
    ///
    /// Subscribing again with the same scope is a no-op. A different scope
    /// fails with [`WsError::ScopeConflict`]; unsubscribe first.
    pub async fn subscribe(&self, channel: Channel, scope: Scope) -> Result<(), WsError> {
        let mut inner = self.shared.inner.lock().await;
        let result = self.shared.add_subscription(&mut inner, channel, scope).await;
        self.shared.release(inner);
        result
    }

    /// Subscribe to order updates for one portfolio.
    pub async fn subscribe_orders(
        &self,
        portfolio_id: impl Into<String>,
        product_ids: Vec<String>,
    ) -> Result<(), WsError> {
        let scope = Scope::portfolio(portfolio_id).with_products(product_ids);
        self.subscribe(Channel::Orders, scope).await
    }

    /// Subscribe to level-2 book updates for a set of products.
    pub async fn subscribe_level2(&self, product_ids: Vec<String>) -> Result<(), WsError> {
        self.subscribe(Channel::Level2, Scope::Products(product_ids)).await
    }

    /// Unsubscribe `channel`. Succeeds without sending anything if the
    /// channel is not active.
    ///
    /// A failed write is not an error: the socket is gone, so the server has
    /// already dropped the subscription and it will not be restored.
    pub async fn unsubscribe(&self, channel: Channel) -> Result<(), WsError> {
        let mut inner = self.shared.inner.lock().await;
        let result = self.shared.remove_subscription(&mut inner, channel).await;
        self.shared.release(inner);
        result
    }

    /// Point the client at a new URL.
    ///
    /// When connected this is a full reconnect: the old socket is closed, a
    /// new one dialed, and every subscription re-sent.
    pub async fn set_url(&self, url: impl Into<String>) -> Result<(), WsError> {
        let mut inner = self.shared.inner.lock().await;
        let result = self.shared.switch_url(&mut inner, url.into()).await;
        self.shared.release(inner);
        result
    }

    /// Close the connection for good. Later operations fail with
    /// [`WsError::Closed`]; calling `close` again is a no-op.
    pub async fn close(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.shutdown(&mut inner).await;
        self.shared.release(inner);
    }

    /// Current connection state. Never blocks.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Active orders/level-2 subscriptions with their ack status.
    pub async fn subscriptions(&self) -> Vec<ActiveSubscription> {
        let inner = self.shared.inner.lock().await;
        inner.registry.active().cloned().collect()
    }

    /// Product ids currently covered by the heartbeat subscription, sorted.
    pub async fn heartbeat_scope(&self) -> Vec<String> {
        let inner = self.shared.inner.lock().await;
        inner.registry.heartbeats().scope()
    }

    pub async fn url(&self) -> String {
        self.shared.inner.lock().await.dialer.url.clone()
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            inner.closed = true;
            if let Some(handle) = inner.recovery.take() {
                handle.abort();
            }
            inner.connection = None;
        }
    }
}

// ─── Reader task ─────────────────────────────────────────────────────────────

fn spawn_reader(shared: Weak<Shared>, stream: FrameStream, generation: u64) -> JoinHandle<()> {
    tokio::spawn(read_loop(shared, stream, generation))
}

fn spawn_recovery(shared: Weak<Shared>, policy: ReconnectPolicy) -> JoinHandle<()> {
    tokio::spawn(reconnect_loop(shared, policy))
}

/// Deliver frames until the stream ends or goes silent, then hand over to
/// reconnect.
async fn read_loop(shared: Weak<Shared>, mut stream: FrameStream, generation: u64) {
    let Some((sink, idle_timeout)) = shared
        .upgrade()
        .map(|s| (Arc::clone(&s.sink), s.idle_timeout))
    else {
        return;
    };
    let mut dispatcher = Dispatcher::new(sink);

    let idle_limit = idle_timeout.unwrap_or(Duration::from_secs(86400));
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            next = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_limit);
                match next {
                    Some(Ok(text)) => {
                        let Some(event) = dispatcher.accept(&text) else {
                            continue;
                        };

                        if let InboundEvent::Subscriptions(ack) = &event {
                            let Some(strong) = shared.upgrade() else {
                                return;
                            };
                            let mismatches = strong.inner.lock().await.registry.reconcile_ack(ack);
                            drop(strong);
                            for err in &mismatches {
                                tracing::warn!("{}", err);
                                dispatcher.report(err);
                            }
                        }

                        dispatcher.deliver(&event);
                    }
                    Some(Err(e)) => break e,
                    None => {
                        break WsError::ConnectionLost {
                            code: None,
                            reason: "Stream ended".into(),
                        }
                    }
                }
            }

            // Heartbeats arrive every second while subscribed; without them
            // the feed may legitimately stay quiet.
            () = &mut idle, if idle_timeout.is_some() => {
                match expects_traffic(&shared).await {
                    None => return,
                    Some(false) => idle.as_mut().reset(Instant::now() + idle_limit),
                    Some(true) => {
                        break WsError::ConnectionLost {
                            code: None,
                            reason: format!("No frames received for {}ms", idle_limit.as_millis()),
                        }
                    }
                }
            }
        }
    };

    drop(stream);
    handle_connection_lost(shared, generation, reason).await;
}

async fn expects_traffic(shared: &Weak<Shared>) -> Option<bool> {
    let strong = shared.upgrade()?;
    let inner = strong.inner.lock().await;
    let active = inner.registry.heartbeats().is_active();
    drop(inner);
    Some(active)
}

/// Close handler: mark the connection dead, notify, then reconnect per policy.
async fn handle_connection_lost(shared: Weak<Shared>, generation: u64, reason: WsError) {
    let Some(strong) = shared.upgrade() else {
        return;
    };
    let mut inner = strong.inner.lock().await;
    if inner.closed || inner.generation != generation {
        return;
    }
    // This task is the reader; keep it alive to run the reconnect loop.
    let reader = strong.drop_connection(&mut inner, reason);
    inner.recovery = reader;
    strong.release(inner);

    let policy = strong.reconnect.clone();
    drop(strong);
    reconnect_loop(shared, policy).await;
}

async fn reconnect_loop(shared: Weak<Shared>, policy: ReconnectPolicy) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if !policy.allows(attempt) {
            if let Some(strong) = shared.upgrade() {
                let mut inner = strong.inner.lock().await;
                inner.recovery = None;
                if policy.enabled && !inner.closed {
                    let err = WsError::ReconnectExhausted {
                        attempts: attempt - 1,
                    };
                    tracing::error!("{}", err);
                    inner.notices.push(Notice::Error(err));
                }
                strong.release(inner);
            }
            return;
        }

        let delay = policy.backoff(attempt);
        match policy.max_attempts {
            Some(max) => tracing::info!(
                "Reconnect attempt {}/{} in {}ms",
                attempt,
                max,
                delay.as_millis()
            ),
            None => tracing::info!("Reconnect attempt {} in {}ms", attempt, delay.as_millis()),
        }
        tokio::time::sleep(delay).await;

        let Some(strong) = shared.upgrade() else {
            return;
        };
        let mut inner = strong.inner.lock().await;
        if inner.closed {
            return;
        }
        if inner.connection.is_some() {
            tracing::debug!("Connection restored elsewhere, stopping reconnect");
            inner.recovery = None;
            return;
        }

        let result = strong.ensure_connected(&mut inner).await;
        if result.is_ok() {
            inner.recovery = None;
        }
        strong.release(inner);

        match result {
            Ok(()) => {
                tracing::info!("Reconnected after {} attempt(s)", attempt);
                return;
            }
            Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Serialize and send a MessageOut over the sink.
async fn send_msg(sink: &mut FrameSink, msg: &MessageOut) -> Result<(), WsError> {
    let json = msg.to_json()?;
    sink.send(json)
        .await
        .map_err(|e| WsError::SendFailed(e.to_string()))
}

fn heartbeat_message(credentials: &Credentials, action: HeartbeatAction) -> MessageOut {
    match action {
        HeartbeatAction::Subscribe(ids) => {
            MessageOut::Subscribe(SubscribeFrame::heartbeats(credentials, &ids, Utc::now()))
        }
        HeartbeatAction::Unsubscribe => {
            MessageOut::Unsubscribe(UnsubscribeFrame::new(Channel::Heartbeats))
        }
    }
}

/// Re-send every recorded subscription on a fresh socket, each freshly signed.
async fn resubscribe_all(
    credentials: &Credentials,
    registry: &mut SubscriptionRegistry,
    sink: &mut FrameSink,
) -> Result<(), WsError> {
    let now = Utc::now();
    let mut frames: Vec<MessageOut> = registry
        .active()
        .map(|sub| {
            MessageOut::Subscribe(SubscribeFrame::for_scope(
                credentials,
                sub.channel,
                &sub.scope,
                now,
            ))
        })
        .collect();
    if let Some(action) = registry.heartbeats_mut().resubscribe() {
        frames.push(heartbeat_message(credentials, action));
    }

    if frames.is_empty() {
        return Ok(());
    }
    tracing::info!("Resubscribing {} channel(s)", frames.len());
    for frame in &frames {
        send_msg(sink, frame).await?;
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! WebSocket sync client for connecting to the hub.
//!
//! Provides:
//! - One logical connection kept alive across physical reconnects
//! - Publish/subscribe fan-out of inbound envelopes to application handlers
//! - Best-effort, at-most-once sends (dropped while not connected)
//! - Correlation-tagged sends for reconciling optimistic mutations
//!
//! State machine:
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Connected
//!      ▲                                               │ close / error
//!      │                                               ▼
//!      └──── disconnect() ──── Reconnecting ◄── wait(delay + jitter)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{Envelope, MessageKind, USER_ID_HEADER};
use crate::reconcile::{PendingMutation, PendingMutations, Reconciliation};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The logical connection moved to a new state
    StateChanged(ConnectionState),
    /// An envelope arrived from the hub
    Message(Envelope),
    /// The preceding `Message` was the echo of our own tracked mutation
    Confirmed(PendingMutation),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:3001`
    pub url: String,
    /// Sent as `x-user-id` during the handshake
    pub identity: Option<String>,
    /// Fixed wait between a close and the next attempt
    pub reconnect_delay: Duration,
    /// Upper bound of a random extra wait added to each attempt
    pub reconnect_jitter: Duration,
    /// Outgoing frames buffered while the socket is busy
    pub outbound_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            identity: None,
            reconnect_delay: Duration::from_secs(5),
            reconnect_jitter: Duration::ZERO,
            outbound_capacity: 256,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("identity is not a valid header value: {0}")]
    InvalidIdentity(String),
}

/// Reconnect timer bookkeeping.
///
/// At most one reconnect is outstanding: a close reported while one is
/// already scheduled does not schedule another. Inside [`SyncClient`] the
/// supervisor loop is sequential, so it never reports a second close before
/// `on_fire`; the schedule supplies the wait and the attempt count.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    delay: Duration,
    jitter: Duration,
    pending: bool,
    scheduled: u64,
}

impl ReconnectSchedule {
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self {
            delay,
            jitter,
            pending: false,
            scheduled: 0,
        }
    }

    /// Transport closed. Returns the wait before the next attempt, or `None`
    /// if an attempt is already scheduled.
    pub fn on_close(&mut self) -> Option<Duration> {
        if self.pending {
            return None;
        }
        self.pending = true;
        self.scheduled += 1;
        Some(self.delay + self.next_jitter())
    }

    /// The scheduled wait elapsed; the attempt is starting.
    pub fn on_fire(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Total reconnects scheduled so far.
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    fn next_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis();
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let roll = Uuid::new_v4().as_u128() % (max_ms + 1);
        Duration::from_millis(roll as u64)
    }
}

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Handler)>,
}

/// Returned by [`SyncClient::subscribe`]; call [`Subscription::unsubscribe`]
/// to deregister the handler.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    config: ClientConfig,
    subscribers: Arc<Mutex<Subscribers>>,
    state: Mutex<ConnectionState>,
    /// Present exactly while a session is open
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    pending: Mutex<PendingMutations>,
    /// Set by `disconnect`; an aborted supervisor still mid-poll must not
    /// reopen the session or publish a new state
    stopped: AtomicBool,
}

/// The sync client.
pub struct SyncClient {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                subscribers: Arc::new(Mutex::new(Subscribers::default())),
                state: Mutex::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                pending: Mutex::new(PendingMutations::new()),
                stopped: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start the connection supervisor. Calling it again while it runs is a
    /// no-op. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.supervisor);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
    }

    /// Stop reconnecting and drop the current session.
    pub fn disconnect(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        lock(&self.inner.outgoing).take();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Register a handler. Handlers run in registration order on the
    /// client's task and survive reconnects.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut subs = lock(&self.inner.subscribers);
        subs.next_id += 1;
        let id = subs.next_id;
        subs.entries.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.subscribers),
        }
    }

    /// Send `{type, payload}` if connected; otherwise the message is dropped.
    /// Returns whether it was handed to the transport.
    pub fn send(&self, kind: impl Into<MessageKind>, payload: Value) -> bool {
        self.inner.send_envelope(&Envelope::new(kind, payload))
    }

    /// Like [`send`](Self::send), tagging the envelope with a correlation id
    /// recorded as pending. Returns the id if the envelope was sent.
    pub fn send_tracked(&self, kind: impl Into<MessageKind>, payload: Value) -> Option<Uuid> {
        let kind = kind.into();
        let correlation_id = lock(&self.inner.pending).track(kind.clone(), payload.clone());
        let envelope = Envelope::new(kind, payload).with_correlation_id(Some(correlation_id));

        if self.inner.send_envelope(&envelope) {
            Some(correlation_id)
        } else {
            lock(&self.inner.pending).cancel(&correlation_id);
            None
        }
    }

    /// Track a mutation that goes out over REST; pass the returned id as
    /// `x-correlation-id`.
    pub fn track_mutation(&self, kind: impl Into<MessageKind>, payload: Value) -> Uuid {
        lock(&self.inner.pending).track(kind.into(), payload)
    }

    /// Drop pending mutations whose echo never arrived.
    pub fn expire_pending(&self, max_age: Duration) -> Vec<PendingMutation> {
        lock(&self.inner.pending).expire_older_than(max_age)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = lock(&self.state);
            if *state == next {
                return;
            }
            if next != ConnectionState::Disconnected && self.is_stopped() {
                return;
            }
            *state = next;
        }
        log::debug!("Sync client {}: {next:?}", self.config.url);
        self.dispatch(&SyncEvent::StateChanged(next));
    }

    /// Fan out to a snapshot so handlers may (un)subscribe while running.
    fn dispatch(&self, event: &SyncEvent) {
        let handlers: Vec<Handler> = lock(&self.subscribers)
            .entries
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn deliver(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("Ignoring unparseable frame from hub: {e}");
                return;
            }
        };
        let reconciliation = lock(&self.pending).reconcile(&envelope);

        self.dispatch(&SyncEvent::Message(envelope));
        if let Reconciliation::Confirmed(local) = reconciliation {
            self.dispatch(&SyncEvent::Confirmed(local));
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Install the session's outgoing queue unless `disconnect` got there first.
    fn attach(&self, tx: mpsc::Sender<Message>) -> bool {
        let mut outgoing = lock(&self.outgoing);
        if self.is_stopped() {
            return false;
        }
        *outgoing = Some(tx);
        true
    }

    fn send_envelope(&self, envelope: &Envelope) -> bool {
        let outgoing = lock(&self.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            log::debug!("Not connected, dropping {}", envelope.kind);
            return false;
        };
        match envelope.encode() {
            Ok(text) => tx.try_send(Message::text(text)).is_ok(),
            Err(e) => {
                log::error!("Could not encode {}: {e}", envelope.kind);
                false
            }
        }
    }

    async fn open(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(identity) = &self.config.identity {
            let value = HeaderValue::from_str(identity)
                .map_err(|_| ClientError::InvalidIdentity(identity.clone()))?;
            request.headers_mut().insert(USER_ID_HEADER, value);
        }
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(ws_stream)
    }

    /// Pump one open socket until it closes.
    async fn run_session(&self, ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        if !self.attach(out_tx) {
            return;
        }
        self.set_state(ConnectionState::Connected);

        loop {
            tokio::select! {
                frame = ws_reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                        Some(Ok(Message::Binary(data))) => self.deliver(&String::from_utf8_lossy(&data)),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("Connection to {} lost: {e}", self.config.url);
                            break;
                        }
                    }
                }
                Some(out) = out_rx.recv() => {
                    if let Err(e) = ws_writer.send(out).await {
                        log::debug!("Write to {} failed: {e}", self.config.url);
                        break;
                    }
                }
            }
        }

        lock(&self.outgoing).take();
    }
}

/// Connect, serve, and reconnect until `disconnect`.
///
/// Attempts run strictly one after another, so only one reconnect is ever
/// pending.
async fn supervise(inner: Arc<Inner>) {
    let mut schedule =
        ReconnectSchedule::new(inner.config.reconnect_delay, inner.config.reconnect_jitter);
    let mut first_attempt = true;

    while !inner.is_stopped() {
        inner.set_state(if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        first_attempt = false;

        match inner.open().await {
            Ok(ws_stream) => {
                log::info!("Connected to {}", inner.config.url);
                inner.run_session(ws_stream).await;
                log::info!("Disconnected from {}", inner.config.url);
            }
            Err(e) => log::warn!("Connection to {} failed: {e}", inner.config.url),
        }
        inner.set_state(ConnectionState::Disconnected);

        if let Some(wait) = schedule.on_close() {
            tokio::time::sleep(wait).await;
            schedule.on_fire();
        }
    }
}

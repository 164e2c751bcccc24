//! Broadcast hub: owns the live-connection set and mediates all fan-out.
//!
//! ```text
//! REST handler ──┐                       ┌──► Connection A (writer task)
//!                ├── broadcast(env) ─────┼──► Connection B (writer task)
//! Peer receive ──┘    (exclude?)         └──► Connection C (writer task)
//!                                              ▲
//! Liveness sweep ── probe / terminate ─────────┘
//! ```
//!
//! Every connection has one bounded outbound queue drained by exactly one
//! writer, so frames for a single socket never interleave. Enqueueing is a
//! non-blocking `try_send`: a full or closed queue is treated as a liveness
//! failure and only that connection is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Envelope, MessageKind, INVALID_MESSAGE_FORMAT};

/// Identity assigned to connections that arrive without `x-user-id`.
pub const ANONYMOUS: &str = "anonymous";

pub type ConnectionId = Uuid;

/// Work item for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded JSON text frame, shared across all recipients
    Frame(Arc<str>),
    /// Liveness probe (WebSocket ping)
    Probe,
    /// Close the transport; nothing follows
    Close,
}

/// Result of routing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Fanned out to `delivered` other connections
    Relayed { kind: MessageKind, delivered: usize },
    InitialStateSent,
    /// Frame did not parse; the sender got an `ERROR` envelope
    Rejected,
    /// Parsed but not a kind the hub routes
    Ignored(MessageKind),
    /// A JSON object without a string `type`; dropped
    Untyped,
    /// The connection is no longer in the live set
    UnknownConnection,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub terminated: usize,
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_accepted: u64,
    pub active_connections: usize,
    pub messages_relayed: u64,
    pub terminated: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub has been shut down")]
    ShutDown,
}

/// A freshly registered connection.
#[derive(Debug)]
pub struct Accepted {
    pub id: ConnectionId,
    pub identity: String,
    /// Drained by the connection's writer
    pub outbound: mpsc::Receiver<Outbound>,
}

struct Connection {
    identity: String,
    /// Answered the last probe
    alive: AtomicBool,
    open: AtomicBool,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn offer(&self, item: Outbound) -> bool {
        self.is_open() && self.tx.try_send(item).is_ok()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Dropping the last sender also ends the writer if the queue is full.
            let _ = self.tx.try_send(Outbound::Close);
        }
    }
}

struct AtomicHubStats {
    total_accepted: AtomicU64,
    messages_relayed: AtomicU64,
    terminated: AtomicU64,
}

/// The hub. Construct once at startup and share as `Arc<BroadcastHub>`.
pub struct BroadcastHub {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Frames buffered per connection before it counts as dead
    outbound_capacity: usize,
    shut_down: AtomicBool,
    stats: AtomicHubStats,
}

impl BroadcastHub {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            outbound_capacity: outbound_capacity.max(1),
            shut_down: AtomicBool::new(false),
            stats: AtomicHubStats {
                total_accepted: AtomicU64::new(0),
                messages_relayed: AtomicU64::new(0),
                terminated: AtomicU64::new(0),
            },
        }
    }

    /// Register a connection and queue its `INITIAL_STATE`.
    ///
    /// `identity` is the raw `x-user-id` header value, if any.
    pub async fn accept(&self, identity: Option<&str>) -> Result<Accepted, HubError> {
        if self.is_shut_down() {
            return Err(HubError::ShutDown);
        }

        let identity = identity
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string();
        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(self.outbound_capacity);
        let conn = Arc::new(Connection {
            identity: identity.clone(),
            alive: AtomicBool::new(true),
            open: AtomicBool::new(true),
            tx,
        });

        let total = {
            let mut conns = self.connections.write().await;
            // shutdown() may have drained the set while we waited for the lock.
            if self.is_shut_down() {
                return Err(HubError::ShutDown);
            }
            conns.insert(id, conn.clone());
            conns.len()
        };
        self.stats.total_accepted.fetch_add(1, Ordering::Relaxed);
        log::info!("Client {identity} connected ({id}). Total clients: {total}");

        self.send_initial_state(id, &conn).await;
        Ok(Accepted {
            id,
            identity,
            outbound,
        })
    }

    /// Route one raw inbound frame from `id`.
    pub async fn receive(&self, id: ConnectionId, raw: &str) -> Dispatch {
        let Some(conn) = self.connection(id).await else {
            return Dispatch::UnknownConnection;
        };

        let envelope = match Envelope::decode_inbound(raw) {
            Ok(Some(env)) => env.with_origin(conn.identity.clone()),
            Ok(None) => {
                log::debug!("Dropping frame without a type from {}", conn.identity);
                return Dispatch::Untyped;
            }
            Err(e) => {
                log::warn!("Malformed frame from {} ({id}): {e}", conn.identity);
                self.send_to(id, &conn, &Envelope::error(INVALID_MESSAGE_FORMAT))
                    .await;
                return Dispatch::Rejected;
            }
        };

        match envelope.kind {
            ref kind if kind.is_peer_relayed() => {
                let delivered = self.broadcast(&envelope, Some(id)).await;
                log::debug!("Relayed {kind} from {} to {delivered} peers", conn.identity);
                Dispatch::Relayed {
                    kind: kind.clone(),
                    delivered,
                }
            }
            MessageKind::RequestInitialState => {
                self.send_initial_state(id, &conn).await;
                Dispatch::InitialStateSent
            }
            other => {
                log::debug!("Unknown message type from {}: {other}", conn.identity);
                Dispatch::Ignored(other)
            }
        }
    }

    /// Deliver `envelope` to every open connection except `exclude`.
    ///
    /// Returns the number of connections the frame was queued for. Shared by
    /// peer relays and commit-time broadcasts from the REST layer.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<ConnectionId>) -> usize {
        if self.is_shut_down() {
            return 0;
        }
        let frame: Arc<str> = match envelope.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                log::error!("Dropping {} broadcast: {e}", envelope.kind);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let conns = self.connections.read().await;
            for (id, conn) in conns.iter() {
                if Some(*id) == exclude || !conn.is_open() {
                    continue;
                }
                if conn.offer(Outbound::Frame(frame.clone())) {
                    delivered += 1;
                } else {
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.terminate(id, "send failed").await;
        }

        self.stats
            .messages_relayed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Record a probe reply.
    pub async fn mark_alive(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.read().await.get(&id) {
            conn.alive.store(true, Ordering::Release);
        }
    }

    /// One liveness pass: terminate silent connections, probe the rest.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut conns = self.connections.write().await;

        let ids: Vec<ConnectionId> = conns.keys().copied().collect();
        for id in ids {
            let keep = match conns.get(&id) {
                Some(conn) => {
                    let answered = conn.alive.swap(false, Ordering::AcqRel);
                    answered && conn.offer(Outbound::Probe)
                }
                None => continue,
            };

            if keep {
                report.probed += 1;
            } else if let Some(conn) = conns.remove(&id) {
                conn.close();
                report.terminated += 1;
                log::info!("Terminated unresponsive client {} ({id})", conn.identity);
            }
        }

        self.stats
            .terminated
            .fetch_add(report.terminated as u64, Ordering::Relaxed);
        report
    }

    /// Forget a connection whose transport closed. Returns whether it was live.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let (removed, total) = {
            let mut conns = self.connections.write().await;
            let removed = conns.remove(&id);
            (removed, conns.len())
        };
        match removed {
            Some(conn) => {
                conn.close();
                log::info!(
                    "Client {} disconnected ({id}). Total clients: {total}",
                    conn.identity
                );
                true
            }
            None => false,
        }
    }

    /// Terminate every connection; later broadcasts attempt nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<Connection>> = {
            let mut conns = self.connections.write().await;
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }
        self.stats
            .terminated
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        log::info!("Hub shut down, {} connections closed", drained.len());
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Get the current live connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Check whether `id` is still in the live set.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Identities of all live connections (unordered).
    pub async fn identities(&self) -> Vec<String> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.identity.clone())
            .collect()
    }

    /// Get a snapshot of the hub counters.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            total_accepted: self.stats.total_accepted.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            terminated: self.stats.terminated.load(Ordering::Relaxed),
        }
    }

    /// Per-connection queue size.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    async fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    async fn send_initial_state(&self, id: ConnectionId, conn: &Connection) {
        self.send_to(id, conn, &Envelope::initial_state(Utc::now()))
            .await;
    }

    async fn send_to(&self, id: ConnectionId, conn: &Connection, envelope: &Envelope) {
        let delivered = match envelope.encode() {
            Ok(text) => conn.offer(Outbound::Frame(text.into())),
            Err(e) => {
                log::error!("Could not encode {}: {e}", envelope.kind);
                return;
            }
        };
        if !delivered {
            self.terminate(id, "send failed").await;
        }
    }

    async fn terminate(&self, id: ConnectionId, reason: &str) {
        let removed = self.connections.write().await.remove(&id);
        if let Some(conn) = removed {
            conn.close();
            self.stats.terminated.fetch_add(1, Ordering::Relaxed);
            log::warn!("Terminated client {} ({id}): {reason}", conn.identity);
        }
    }
}

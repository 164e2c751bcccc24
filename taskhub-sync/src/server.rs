//! WebSocket front end for the [`BroadcastHub`].
//!
//! Architecture:
//! ```text
//! TcpListener ── accept_hdr_async (x-user-id) ── hub.accept()
//!                                                   │
//!            ┌──────────────── per connection ──────┴───────────┐
//!            │ select! { socket frame  → hub.receive/mark_alive │
//!            │           outbound item → socket write         } │
//!            └──────────────────────────────────────────────────┘
//! interval(heartbeat) ── hub.sweep()
//! ```
//!
//! Each connection is served by one task, which is the only writer of its
//! socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{Accepted, BroadcastHub, HubError, Outbound};
use crate::protocol::USER_ID_HEADER;

/// Hub server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Period of the liveness sweep
    pub heartbeat_interval: Duration,
    /// Frames buffered per connection before it is dropped as dead
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Stops a running [`HubServer`] from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
    hub: Arc<BroadcastHub>,
}

impl ShutdownHandle {
    /// Stop accepting, cancel the sweep timer and terminate every connection.
    pub async fn shutdown(&self) {
        self.signal.send_replace(true);
        self.hub.shutdown().await;
    }
}

/// A bound, not yet running hub server.
pub struct HubServer {
    config: HubConfig,
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    signal: Arc<watch::Sender<bool>>,
}

impl HubServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(config: HubConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let hub = Arc::new(BroadcastHub::new(config.outbound_capacity));
        let (signal, _) = watch::channel(false);
        Ok(Self {
            config,
            listener,
            hub,
            signal: Arc::new(signal),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for broadcasting from other components.
    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: self.signal.clone(),
            hub: self.hub.clone(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Serve until [`ShutdownHandle::shutdown`] is called.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut shutdown = self.signal.subscribe();
        log::info!("Hub listening on {}", self.local_addr()?);

        let sweeper = tokio::spawn(sweep_loop(
            self.hub.clone(),
            self.config.heartbeat_interval,
            self.signal.subscribe(),
        ));

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.hub.shutdown().await;
        let _ = sweeper.await;
        log::info!("Hub server stopped");
        Ok(())
    }
}

async fn sweep_loop(hub: Arc<BroadcastHub>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let report = hub.sweep().await;
                if report.terminated > 0 {
                    log::info!(
                        "Liveness sweep: {} probed, {} terminated",
                        report.probed,
                        report.terminated
                    );
                }
            }
        }
    }
}

/// Serve one WebSocket connection until either side closes it.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
) -> Result<(), ServerError> {
    let mut identity: Option<String> = None;
    let capture_identity = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        identity = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_identity).await?;

    let Accepted {
        id, mut outbound, ..
    } = hub.accept(identity.as_deref()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        hub.receive(id, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        hub.receive(id, &String::from_utf8_lossy(&data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => hub.mark_alive(id).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }

            item = outbound.recv() => {
                let sent = match item {
                    Some(Outbound::Frame(text)) => ws_sender.send(Message::text(text.to_string())).await,
                    Some(Outbound::Probe) => ws_sender.send(Message::Ping(Default::default())).await,
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sent {
                    log::warn!("Write to {addr} failed: {e}");
                    break;
                }
            }
        }
    }

    hub.remove(id).await;
    Ok(())
}

//! # taskhub-sync: Real-time synchronization layer for taskhub
//!
//! Keeps every browser-side client live with task, owner and custom-field
//! mutations over a WebSocket fan-out channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ HubServer    │
//! │ (per user)  │     JSON envelopes  │ (accept loop)│
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐     commit-time
//! │ subscribers │                     │ BroadcastHub │ ◄── broadcasts from
//! │ + pending   │                     │ (live set,   │     the REST layer
//! │ mutations   │                     │  liveness)   │
//! └─────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire envelope and message kinds
//! - [`hub`]: Live-connection set, routing, fan-out, liveness sweep
//! - [`server`]: WebSocket accept loop and per-connection pump
//! - [`client`]: Reconnecting client with subscriber fan-out
//! - [`reconcile`]: Correlation of echoes with optimistic mutations

pub mod protocol;
pub mod hub;
pub mod server;
pub mod client;
pub mod reconcile;

// Re-exports for convenience
pub use protocol::{
    Envelope, InitialState, MessageKind, ProtocolError, CORRELATION_ID_HEADER,
    INVALID_MESSAGE_FORMAT, USER_ID_HEADER,
};
pub use hub::{
    Accepted, BroadcastHub, ConnectionId, Dispatch, HubError, HubStats, Outbound, SweepReport,
    ANONYMOUS,
};
pub use server::{HubConfig, HubServer, ServerError, ShutdownHandle};
pub use client::{
    ClientConfig, ClientError, ConnectionState, ReconnectSchedule, Subscription, SyncClient,
    SyncEvent,
};
pub use reconcile::{PendingMutation, PendingMutations, Reconciliation};

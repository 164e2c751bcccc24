//! Matching server echoes against locally applied optimistic mutations.
//!
//! A client that applies an edit before the server confirms it tags the
//! outbound envelope with a fresh correlation id. The hub relays the id
//! untouched and the REST layer copies it from `x-correlation-id` onto the
//! commit broadcast, so when the echo comes back the originator can tell
//! "confirmation of my own edit" apart from "someone else's edit".
//! Envelopes without a known id are foreign and win (last write wins).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{Envelope, MessageKind};

/// An optimistic mutation awaiting its authoritative echo.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub correlation_id: Uuid,
    pub kind: MessageKind,
    /// What was applied locally
    pub payload: Value,
    pub issued_at: Instant,
}

/// Outcome of checking an inbound envelope against the pending set.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Echo of our own mutation; the pending entry is retired
    Confirmed(PendingMutation),
    /// Not ours (or already reconciled)
    Foreign,
}

#[derive(Debug, Default)]
pub struct PendingMutations {
    entries: HashMap<Uuid, PendingMutation>,
}

impl PendingMutations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation and return the correlation id to send with it.
    pub fn track(&mut self, kind: MessageKind, payload: Value) -> Uuid {
        let correlation_id = Uuid::new_v4();
        self.entries.insert(
            correlation_id,
            PendingMutation {
                correlation_id,
                kind,
                payload,
                issued_at: Instant::now(),
            },
        );
        correlation_id
    }

    pub fn reconcile(&mut self, envelope: &Envelope) -> Reconciliation {
        envelope
            .correlation_id
            .and_then(|id| self.entries.remove(&id))
            .map_or(Reconciliation::Foreign, Reconciliation::Confirmed)
    }

    /// Forget a mutation that never made it onto the wire.
    pub fn cancel(&mut self, correlation_id: &Uuid) -> Option<PendingMutation> {
        self.entries.remove(correlation_id)
    }

    /// Drop entries older than `max_age`, returning them so the caller can
    /// roll back or refetch.
    pub fn expire_older_than(&mut self, max_age: Duration) -> Vec<PendingMutation> {
        let expired: Vec<Uuid> = self
            .entries
            .values()
            .filter(|m| m.issued_at.elapsed() >= max_age)
            .map(|m| m.correlation_id)
            .collect();
        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

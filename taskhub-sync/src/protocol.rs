//! JSON wire protocol for the real-time channel.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! { "type": "TASK_UPDATE", "payload": {...}, "userId": "alice", "correlationId": "<uuid>" }
//! ```
//!
//! `userId` is the origin identity. It is stamped by the hub from the
//! sending connection; whatever a client puts there is overwritten.
//! `correlationId` is optional and carried through relays untouched so an
//! originator can recognise the echo of its own optimistic mutation.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Payload of the `ERROR` envelope sent back for unparseable frames.
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";

/// Handshake header carrying the connection identity.
pub const USER_ID_HEADER: &str = "x-user-id";

/// REST request header whose value is copied onto the commit broadcast.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Envelope kind, carried on the wire as the raw `type` string.
///
/// Unknown strings survive a decode/encode cycle verbatim through
/// [`MessageKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Peer-originated task edit, relayed to everyone but the sender
    TaskUpdate,
    /// Peer-originated custom field edit, relayed to everyone but the sender
    CustomFieldUpdate,
    /// Client asks the hub to resend `INITIAL_STATE`
    RequestInitialState,
    /// Sent by the hub on accept and on request
    InitialState,
    /// Sent by the hub when a frame could not be parsed
    Error,
    TaskCreated,
    TaskUpdated,
    OwnerCreated,
    OwnerUpdated,
    CustomFieldCreated,
    CustomFieldUpdated,
    CustomFieldDeleted,
    /// Any other tag, relayed untouched
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskUpdate => "TASK_UPDATE",
            Self::CustomFieldUpdate => "CUSTOM_FIELD_UPDATE",
            Self::RequestInitialState => "REQUEST_INITIAL_STATE",
            Self::InitialState => "INITIAL_STATE",
            Self::Error => "ERROR",
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskUpdated => "TASK_UPDATED",
            Self::OwnerCreated => "OWNER_CREATED",
            Self::OwnerUpdated => "OWNER_UPDATED",
            Self::CustomFieldCreated => "CUSTOM_FIELD_CREATED",
            Self::CustomFieldUpdated => "CUSTOM_FIELD_UPDATED",
            Self::CustomFieldDeleted => "CUSTOM_FIELD_DELETED",
            Self::Other(tag) => tag,
        }
    }

    /// Kinds the hub fans out to every peer except the sender.
    pub fn is_peer_relayed(&self) -> bool {
        matches!(self, Self::TaskUpdate | Self::CustomFieldUpdate)
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        match tag {
            "TASK_UPDATE" => Self::TaskUpdate,
            "CUSTOM_FIELD_UPDATE" => Self::CustomFieldUpdate,
            "REQUEST_INITIAL_STATE" => Self::RequestInitialState,
            "INITIAL_STATE" => Self::InitialState,
            "ERROR" => Self::Error,
            "TASK_CREATED" => Self::TaskCreated,
            "TASK_UPDATED" => Self::TaskUpdated,
            "OWNER_CREATED" => Self::OwnerCreated,
            "OWNER_UPDATED" => Self::OwnerUpdated,
            "CUSTOM_FIELD_CREATED" => Self::CustomFieldCreated,
            "CUSTOM_FIELD_UPDATED" => Self::CustomFieldUpdated,
            "CUSTOM_FIELD_DELETED" => Self::CustomFieldDeleted,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match Self::from(tag.as_str()) {
            Self::Other(_) => Self::Other(tag),
            known => known,
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `INITIAL_STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialState {
    /// RFC 3339 / ISO-8601 server time
    pub timestamp: String,
}

/// The unit of exchange on the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    /// Origin identity; only trustworthy on envelopes produced by the hub
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<Uuid>,
}

impl Envelope {
    pub fn new(kind: impl Into<MessageKind>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            origin: None,
            correlation_id: None,
        }
    }

    /// `INITIAL_STATE` stamped with the given server time.
    pub fn initial_state(now: DateTime<Utc>) -> Self {
        let state = InitialState {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        Self::new(
            MessageKind::InitialState,
            serde_json::to_value(state).unwrap_or(Value::Null),
        )
    }

    /// `ERROR` with a plain string diagnostic.
    pub fn error(diagnostic: &str) -> Self {
        Self::new(MessageKind::Error, Value::String(diagnostic.to_string()))
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Decode the payload into the type the consumer of this kind expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::Payload {
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a frame received from a peer.
    ///
    /// Only text that is not a JSON object is an error. The wire `userId` is
    /// discarded, a `correlationId` that is not a UUID is treated as absent,
    /// and a missing or non-string `type` yields `Ok(None)`.
    pub fn decode_inbound(raw: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::Deserialization(
                "frame is not a JSON object".to_string(),
            ));
        }
        let frame: InboundFrame = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        Ok(frame.kind.map(|kind| Self {
            kind,
            payload: frame.payload,
            origin: None,
            correlation_id: frame.correlation_id,
        }))
    }
}

/// Shape accepted from peers; unknown keys, `userId` included, are skipped.
#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    kind: Option<MessageKind>,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "correlationId", default, deserialize_with = "lenient")]
    correlation_id: Option<Uuid>,
}

/// Any value that does not decode as `T` becomes `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Payload of {kind} did not match the expected shape: {reason}")]
    Payload { kind: String, reason: String },
}

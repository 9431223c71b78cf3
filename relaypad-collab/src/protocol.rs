//! Relay wire protocol: the REQ / CLOSE / EVENT subset every relay speaks.
//!
//! Frames are JSON arrays carried in websocket text messages:
//! ```text
//! client → relay   ["REQ", sub_id, filter]      ["CLOSE", sub_id]      ["EVENT", event]
//! relay → client   ["EVENT", sub_id, event]     ["EOSE", sub_id]       ["NOTICE", text]
//!                  ["OK", event_id, bool, text] ["CLOSED", sub_id, text]
//! ```
//!
//! Unknown or malformed relay frames surface as [`ProtocolError`] and are
//! dropped by the connection layer without tearing down the socket.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::SignedEvent;

// ─── Event kinds ────────────────────────────────────────────────────

/// Event kinds used by the collaboration layer.
///
/// | Kind  | Meaning |
/// |-------|---------|
/// | 0     | profile metadata |
/// | 9337  | live CRDT update |
/// | 31338 | replaceable snapshot (merged on receipt) |
/// | 9338  | appended snapshot history (cached, applied on request) |
/// | 31339 | presence announcement |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum EventKind {
    Metadata,
    LiveUpdate,
    ReplaceableSnapshot,
    SnapshotHistory,
    Presence,
    Other(u32),
}

impl EventKind {
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Metadata => 0,
            Self::LiveUpdate => 9337,
            Self::ReplaceableSnapshot => 31338,
            Self::SnapshotHistory => 9338,
            Self::Presence => 31339,
            Self::Other(kind) => kind,
        }
    }

    pub const fn from_u32(kind: u32) -> Self {
        match kind {
            0 => Self::Metadata,
            9337 => Self::LiveUpdate,
            31338 => Self::ReplaceableSnapshot,
            9338 => Self::SnapshotHistory,
            31339 => Self::Presence,
            other => Self::Other(other),
        }
    }

    pub const fn is_snapshot(self) -> bool {
        matches!(self, Self::ReplaceableSnapshot | Self::SnapshotHistory)
    }

    /// Relays keep only the newest event per (kind, author, document tag)
    /// for kinds in this range.
    pub const fn is_parameterized_replaceable(self) -> bool {
        let kind = self.as_u32();
        kind >= 30_000 && kind < 40_000
    }

    /// Relays keep only the newest event per (kind, author).
    pub const fn is_replaceable(self) -> bool {
        let kind = self.as_u32();
        kind == 0 || kind == 3 || (kind >= 10_000 && kind < 20_000)
    }
}

impl From<u32> for EventKind {
    fn from(kind: u32) -> Self {
        Self::from_u32(kind)
    }
}

impl From<EventKind> for u32 {
    fn from(kind: EventKind) -> Self {
        kind.as_u32()
    }
}

// ─── Filters ────────────────────────────────────────────────────────

/// Subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<EventKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(rename = "#d", default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn author(mut self, public_key: impl Into<String>) -> Self {
        self.authors.push(public_key.into());
        self
    }

    pub fn document(mut self, document_id: impl Into<String>) -> Self {
        self.documents.push(document_id.into());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every populated field. `limit` only bounds
    /// stored-event replay and is ignored here.
    pub fn matches(&self, event: &SignedEvent) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == event.pubkey) {
            return false;
        }
        if !self.documents.is_empty() {
            match event.document_tag() {
                Some(doc) if self.documents.iter().any(|d| d == doc) => {}
                _ => return false,
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

// ─── Frames ─────────────────────────────────────────────────────────

/// Errors from frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a JSON array")]
    NotAnArray,
    #[error("Unknown frame type: {0}")]
    UnknownFrame(String),
    #[error("Malformed {0} frame")]
    Malformed(&'static str),
}

/// Frames sent from a client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req { subscription_id: String, filter: Filter },
    Close(String),
    Event(SignedEvent),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let frame = match self {
            Self::Req { subscription_id, filter } => {
                json!(["REQ", subscription_id, serde_json::to_value(filter)?])
            }
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            Self::Event(event) => json!(["EVENT", serde_json::to_value(event)?]),
        };
        Ok(frame.to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_frame(text)?;
        match frame_type(&frame)? {
            "REQ" => {
                let subscription_id = string_at(&frame, 1, "REQ")?;
                // Multiple filters are legal on the wire; the first one is honoured.
                let filter = frame
                    .get(2)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                Ok(Self::Req { subscription_id, filter })
            }
            "CLOSE" => Ok(Self::Close(string_at(&frame, 1, "CLOSE")?)),
            "EVENT" => {
                let event = frame.get(1).cloned().ok_or(ProtocolError::Malformed("EVENT"))?;
                Ok(Self::Event(serde_json::from_value(event)?))
            }
            other => Err(ProtocolError::UnknownFrame(other.to_string())),
        }
    }
}

/// Frames sent from a relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { subscription_id: String, event: SignedEvent },
    EndOfStoredEvents(String),
    Notice(String),
    Ok { event_id: String, accepted: bool, message: String },
    Closed { subscription_id: String, message: String },
}

impl RelayMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let frame = match self {
            Self::Event { subscription_id, event } => {
                json!(["EVENT", subscription_id, serde_json::to_value(event)?])
            }
            Self::EndOfStoredEvents(subscription_id) => json!(["EOSE", subscription_id]),
            Self::Notice(message) => json!(["NOTICE", message]),
            Self::Ok { event_id, accepted, message } => json!(["OK", event_id, accepted, message]),
            Self::Closed { subscription_id, message } => json!(["CLOSED", subscription_id, message]),
        };
        Ok(frame.to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let frame = parse_frame(text)?;
        match frame_type(&frame)? {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1, "EVENT")?;
                let event = frame.get(2).cloned().ok_or(ProtocolError::Malformed("EVENT"))?;
                Ok(Self::Event { subscription_id, event: serde_json::from_value(event)? })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents(string_at(&frame, 1, "EOSE")?)),
            "NOTICE" => Ok(Self::Notice(string_at(&frame, 1, "NOTICE")?)),
            "OK" => Ok(Self::Ok {
                event_id: string_at(&frame, 1, "OK")?,
                accepted: frame
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(ProtocolError::Malformed("OK"))?,
                message: optional_string_at(&frame, 3),
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&frame, 1, "CLOSED")?,
                message: optional_string_at(&frame, 2),
            }),
            other => Err(ProtocolError::UnknownFrame(other.to_string())),
        }
    }
}

fn parse_frame(text: &str) -> Result<Vec<Value>, ProtocolError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        _ => Err(ProtocolError::NotAnArray),
    }
}

fn frame_type(frame: &[Value]) -> Result<&str, ProtocolError> {
    frame
        .first()
        .and_then(Value::as_str)
        .ok_or(ProtocolError::Malformed("untyped"))
}

fn string_at(frame: &[Value], index: usize, name: &'static str) -> Result<String, ProtocolError> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::Malformed(name))
}

fn optional_string_at(frame: &[Value], index: usize) -> String {
    frame
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────

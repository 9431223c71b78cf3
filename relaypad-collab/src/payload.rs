//! Typed decoding of event content.
//!
//! Binary CRDT data travels base64-encoded in `content`; presence travels
//! as a JSON object `{clientId, state, ts}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::Update;

use crate::event::SignedEvent;
use crate::protocol::EventKind;
use crate::snapshot::SnapshotKind;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("CRDT update decoding failed: {0}")]
    Crdt(String),
    #[error("Presence decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Presence announcement has no client id")]
    MissingClientId,
    #[error("Unsupported event kind {0}")]
    UnsupportedKind(u32),
}

pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_binary(text: &str) -> Result<Vec<u8>, PayloadError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Presence content. A `None` state announces that the client went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    #[serde(rename = "clientId")]
    pub client_id: u64,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub ts: u64,
}

impl PresenceAnnouncement {
    pub fn parse(content: &str) -> Result<Self, PayloadError> {
        let announcement: Self = serde_json::from_str(content)?;
        if announcement.client_id == 0 {
            return Err(PayloadError::MissingClientId);
        }
        Ok(announcement)
    }

    pub fn to_json(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decoded event content, one variant per collaboration kind.
#[derive(Debug)]
pub enum Payload {
    Update(Update),
    Snapshot { kind: SnapshotKind, update: Update },
    Presence(PresenceAnnouncement),
}

impl Payload {
    pub fn decode(event: &SignedEvent) -> Result<Self, PayloadError> {
        match event.kind {
            EventKind::LiveUpdate => Ok(Self::Update(decode_update(&event.content)?)),
            EventKind::ReplaceableSnapshot => Ok(Self::Snapshot {
                kind: SnapshotKind::Replaceable,
                update: decode_update(&event.content)?,
            }),
            EventKind::SnapshotHistory => Ok(Self::Snapshot {
                kind: SnapshotKind::History,
                update: decode_update(&event.content)?,
            }),
            EventKind::Presence => Ok(Self::Presence(PresenceAnnouncement::parse(&event.content)?)),
            other => Err(PayloadError::UnsupportedKind(other.as_u32())),
        }
    }
}

fn decode_update(content: &str) -> Result<Update, PayloadError> {
    let bytes = decode_binary(content)?;
    Update::decode_v1(&bytes).map_err(|e| PayloadError::Crdt(e.to_string()))
}

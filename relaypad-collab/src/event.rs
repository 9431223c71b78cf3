//! Signed relay events.
//!
//! The event id is the SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is a
//! BIP-340 Schnorr signature over the 32 id bytes.

use k256::schnorr::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::identity::IdentityError;
use crate::protocol::EventKind;

/// Name of the tag carrying the document id.
pub const DOCUMENT_TAG: &str = "d";

/// An event awaiting a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub created_at: u64,
    pub kind: EventKind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: EventKind, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Adds the `["d", document_id]` tag.
    pub fn with_document(mut self, document_id: &str) -> Self {
        self.tags.push(vec![DOCUMENT_TAG.to_string(), document_id.to_string()]);
        self
    }

    pub fn id_for(&self, pubkey: &str) -> [u8; 32] {
        event_id(pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

/// A signed event as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: EventKind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    pub fn document_tag(&self) -> Option<&str> {
        self.tag_value(DOCUMENT_TAG)
    }

    /// Checks that the id matches the content and that the signature was
    /// produced by `pubkey`.
    pub fn verify(&self) -> Result<(), IdentityError> {
        let id = event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(id) != self.id {
            return Err(IdentityError::IdMismatch);
        }

        let key_bytes = hex::decode(&self.pubkey)?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| IdentityError::InvalidPublicKey(self.pubkey.clone()))?;
        let sig_bytes = hex::decode(&self.sig)?;
        let signature =
            Signature::try_from(sig_bytes.as_slice()).map_err(|_| IdentityError::InvalidSignature)?;

        key.verify_raw(&id, &signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }
}

/// Computes the event id over the canonical array serialization.
pub fn event_id(
    pubkey: &str,
    created_at: u64,
    kind: EventKind,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = json!([0, pubkey, created_at, kind.as_u32(), tags, content]);
    Sha256::digest(canonical.to_string().as_bytes()).into()
}

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::payload::PayloadError;
use crate::storage::StoreError;
use crate::transport::{PublishError, SubscribeError};

/// Errors surfaced by channels and sessions.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("Event is tagged for {found:?}, expected {expected}")]
    ForeignDocument { expected: String, found: Option<String> },
    #[error("Event kind {0} is not a snapshot")]
    NotASnapshot(u32),
    #[error("Event kind {0} does not belong on this channel")]
    UnexpectedKind(u32),
    #[error("Channel is closed")]
    Closed,
}

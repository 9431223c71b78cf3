//! The seam between channels and the network.
//!
//! ```text
//! ┌──────────────────┐                 ┌──────────────────────────┐
//! │ DocumentChannel  │── publish ────► │ Transport                │
//! │ PresenceChannel  │◄─ EventSink ─── │  ├─ RelaySet  (websocket) │
//! └──────────────────┘                 │  └─ MemoryHub (loopback)  │
//!                                      └──────────────────────────┘
//! ```
//!
//! Publishing succeeds as soon as one relay accepts; subscriptions deliver
//! every matching event from every relay, duplicates included.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::{SignedEvent, UnsignedEvent};
use crate::identity::Signer;
use crate::protocol::{Filter, ProtocolError};
use crate::relay::RelayError;
use crate::CollabError;

pub use memory::{HubStats, MemoryHub};

pub type SubscriptionId = String;

/// Something delivered on a subscription.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Event { relay: Arc<str>, event: SignedEvent },
    /// The relay finished replaying stored events.
    EndOfStoredEvents { relay: Arc<str> },
}

pub type EventSink = mpsc::UnboundedSender<InboundEvent>;

/// Proof that at least one relay accepted an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub relay: String,
    pub event_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No relays configured")]
    NoRelays,
    #[error("All {} relays failed to accept the event", .0.len())]
    AllRelaysFailed(Vec<(String, RelayError)>),
    #[error("Failed to encode event: {0}")]
    Encode(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("No relays configured")]
    NoRelays,
    #[error("Transport is closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `event` to every relay; resolves with the first acceptance.
    async fn publish(&self, event: &SignedEvent) -> Result<PublishReceipt, PublishError>;

    /// Registers `filter` on every relay. Matching events flow into `sink`
    /// until [`Transport::unsubscribe`] is called.
    fn subscribe(&self, filter: Filter, sink: EventSink) -> Result<SubscriptionId, SubscribeError>;

    fn unsubscribe(&self, id: &SubscriptionId);
}

pub(crate) fn new_subscription_id() -> SubscriptionId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Signs `unsigned` and publishes the result.
pub async fn sign_and_publish(
    signer: &dyn Signer,
    transport: &dyn Transport,
    unsigned: UnsignedEvent,
) -> Result<SignedEvent, CollabError> {
    let event = signer.sign_event(unsigned).await?;
    match transport.publish(&event).await {
        Ok(receipt) => {
            log::debug!(
                "Event {} (kind {}) accepted by {}",
                receipt.event_id,
                event.kind.as_u32(),
                receipt.relay
            );
            Ok(event)
        }
        Err(e) => {
            log::error!("Publishing event {} failed: {e}", event.id);
            Err(e.into())
        }
    }
}

//! In-process loopback relay.
//!
//! Behaves like a single well-behaved relay: stores what it accepts
//! (honouring replaceable kinds), replays stored matches followed by an
//! end-of-stored-events marker on subscribe, and fans every accepted event
//! out to all matching subscriptions, the publisher's own included.
//! Used for local mode and for deterministic tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    new_subscription_id, EventSink, InboundEvent, PublishError, PublishReceipt, SubscribeError,
    SubscriptionId, Transport,
};
use crate::event::SignedEvent;
use crate::protocol::Filter;
use crate::relay::RelayError;

/// Counters for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub published: u64,
    pub delivered: u64,
    pub stored: usize,
    pub subscriptions: usize,
}

struct HubSubscription {
    filter: Filter,
    sink: EventSink,
}

#[derive(Default)]
struct HubState {
    events: Vec<SignedEvent>,
    subscriptions: HashMap<SubscriptionId, HubSubscription>,
}

pub struct MemoryHub {
    name: Arc<str>,
    state: Mutex<HubState>,
    offline: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Mutex::new(HubState::default()),
            offline: AtomicBool::new(false),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// While offline every publish fails, as if no relay were reachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Stores and delivers `event` without counting it as a publish.
    /// Lets tests feed arbitrary, even unsigned, events.
    pub fn inject(&self, event: SignedEvent) {
        self.accept(event);
    }

    pub fn stored_events(&self) -> Vec<SignedEvent> {
        self.lock().events.clone()
    }

    pub fn stats(&self) -> HubStats {
        let state = self.lock();
        HubStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            stored: state.events.len(),
            subscriptions: state.subscriptions.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(&self, event: SignedEvent) {
        let mut state = self.lock();

        if !state.events.iter().any(|stored| stored.id == event.id) {
            if event.kind.is_parameterized_replaceable() || event.kind.is_replaceable() {
                let parameterized = event.kind.is_parameterized_replaceable();
                state.events.retain(|stored| {
                    let same_slot = stored.kind == event.kind
                        && stored.pubkey == event.pubkey
                        && (!parameterized || stored.document_tag() == event.document_tag());
                    !same_slot || stored.created_at > event.created_at
                });
                let superseded = state.events.iter().any(|stored| {
                    stored.kind == event.kind
                        && stored.pubkey == event.pubkey
                        && (!parameterized || stored.document_tag() == event.document_tag())
                });
                if !superseded {
                    state.events.push(event.clone());
                }
            } else {
                state.events.push(event.clone());
            }
        }

        state.subscriptions.retain(|_, sub| {
            if !sub.filter.matches(&event) {
                return true;
            }
            let delivered = sub
                .sink
                .send(InboundEvent::Event { relay: self.name.clone(), event: event.clone() })
                .is_ok();
            if delivered {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            // Receivers that went away are pruned.
            delivered
        });
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn publish(&self, event: &SignedEvent) -> Result<PublishReceipt, PublishError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::AllRelaysFailed(vec![(
                self.name.to_string(),
                RelayError::Closed,
            )]));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.accept(event.clone());
        Ok(PublishReceipt {
            relay: self.name.to_string(),
            event_id: event.id.clone(),
        })
    }

    fn subscribe(&self, filter: Filter, sink: EventSink) -> Result<SubscriptionId, SubscribeError> {
        let id = new_subscription_id();
        let mut state = self.lock();

        let mut replay: Vec<&SignedEvent> =
            state.events.iter().filter(|event| filter.matches(event)).collect();
        if let Some(limit) = filter.limit {
            replay.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            replay.truncate(limit);
            replay.reverse();
        }
        for event in replay {
            let _ = sink.send(InboundEvent::Event { relay: self.name.clone(), event: event.clone() });
        }
        let _ = sink.send(InboundEvent::EndOfStoredEvents { relay: self.name.clone() });

        state.subscriptions.insert(id.clone(), HubSubscription { filter, sink });
        Ok(id)
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        self.lock().subscriptions.remove(id);
    }
}

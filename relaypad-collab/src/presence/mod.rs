//! Presence channel: who is here, and what their ephemeral state is.
//!
//! ```text
//! set_local_state ──► dedup (content equality) ──► publish kind 31339
//! heartbeat (15s) ──► forced re-publish while local state is non-null
//! Transport ──► handle_event ──► Roster::apply ──► RosterChange broadcast
//! sweep (10s) ──► Roster::sweep (40s without refresh ⇒ evicted)
//! close ──► best-effort null announcement
//! ```
//!
//! Presence is never persisted and never merged into the document.

pub mod roster;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::config::PresenceConfig;
use crate::event::{SignedEvent, UnsignedEvent};
use crate::identity::{ParticipantMode, Signer};
use crate::payload::PresenceAnnouncement;
use crate::protocol::{EventKind, Filter};
use crate::transport::{sign_and_publish, InboundEvent, SubscriptionId, Transport};
use crate::CollabError;

pub use roster::{display_name, ClientId, Roster, RosterChange, RosterEntry, StableIdentity};

pub struct PresenceOptions {
    pub document_id: String,
    pub local_client_id: ClientId,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub mode: ParticipantMode,
    pub clock: Arc<dyn Clock>,
    pub config: PresenceConfig,
}

impl PresenceOptions {
    pub fn new(
        document_id: impl Into<String>,
        local_client_id: ClientId,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            local_client_id,
            transport,
            signer,
            mode: ParticipantMode::Personal,
            clock: Arc::new(SystemClock),
            config: PresenceConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: ParticipantMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: PresenceConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Default)]
struct LocalPresence {
    state: Option<Value>,
    /// JSON of the last state published through the dedup path.
    last_sent: Option<String>,
}

struct Inner {
    document_id: String,
    local_client_id: ClientId,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    roster: Mutex<Roster>,
    local: Mutex<LocalPresence>,
    changes: broadcast::Sender<RosterChange>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PresenceChannel {
    inner: Arc<Inner>,
    subscription: Option<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl PresenceChannel {
    pub async fn open(options: PresenceOptions) -> Result<Self, CollabError> {
        let PresenceOptions {
            document_id,
            local_client_id,
            transport,
            signer,
            mode,
            clock,
            config,
        } = options;

        let public_key = signer.public_key().await?;
        let (changes, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            roster: Mutex::new(Roster::new(local_client_id, public_key, mode, &config)),
            document_id,
            local_client_id,
            transport,
            signer,
            clock,
            local: Mutex::new(LocalPresence::default()),
            changes,
        });

        let since = inner.clock.now_secs().saturating_sub(config.lookback_secs);
        let filter = Filter::new()
            .kinds([EventKind::Presence])
            .document(inner.document_id.clone())
            .since(since);
        let (sink, inbound) = mpsc::unbounded_channel();
        let subscription = inner.transport.subscribe(filter, sink)?;
        log::info!("Presence for {} open as client {local_client_id}", inner.document_id);

        let tasks = vec![
            tokio::spawn(inbound_loop(inner.clone(), inbound)),
            tokio::spawn(heartbeat_loop(inner.clone(), config.heartbeat())),
            tokio::spawn(sweep_loop(inner.clone(), config.sweep())),
        ];

        Ok(Self {
            inner,
            subscription: Some(subscription),
            tasks,
            closed: false,
        })
    }

    pub fn local_client_id(&self) -> ClientId {
        self.inner.local_client_id
    }

    pub fn local_state(&self) -> Option<Value> {
        lock(&self.inner.local).state.clone()
    }

    /// Replaces the local state and publishes it unless it equals the last
    /// published state. Returns the published event, if any.
    pub async fn set_local_state(
        &self,
        state: Option<Value>,
    ) -> Result<Option<SignedEvent>, CollabError> {
        lock(&self.inner.local).state = state;
        self.inner.publish_local(false).await
    }

    /// Re-publishes the local state regardless of dedup.
    pub async fn heartbeat(&self) -> Result<Option<SignedEvent>, CollabError> {
        self.inner.heartbeat().await
    }

    /// Feeds one relay event through the roster.
    pub fn handle_event(&self, event: &SignedEvent) -> RosterChange {
        self.inner.handle_event(event)
    }

    /// Evicts entries that stopped refreshing.
    pub fn sweep(&self) -> RosterChange {
        self.inner.sweep()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        lock(&self.inner.roster).entries().cloned().collect()
    }

    /// Remote states keyed by client id.
    pub fn states(&self) -> std::collections::BTreeMap<ClientId, Value> {
        lock(&self.inner.roster).states()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RosterChange> {
        self.inner.changes.subscribe()
    }

    /// Stops timers and the subscription, then announces departure
    /// (fire-and-forget, only when a runtime is available).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(id) = self.subscription.take() {
            self.inner.transport.unsubscribe(&id);
        }

        lock(&self.inner.local).state = None;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move {
                if let Err(e) = inner.publish_local(true).await {
                    log::debug!("Departure announcement for {} failed: {e}", inner.document_id);
                }
            });
        }
        log::info!("Presence for {} closed", self.inner.document_id);
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn handle_event(&self, event: &SignedEvent) -> RosterChange {
        if event.kind != EventKind::Presence || event.document_tag() != Some(self.document_id.as_str()) {
            log::debug!("Ignoring non-presence event {}", event.id);
            return RosterChange::default();
        }
        let announcement = match PresenceAnnouncement::parse(&event.content) {
            Ok(announcement) => announcement,
            Err(e) => {
                log::debug!("Discarding presence {}: {e}", event.id);
                return RosterChange::default();
            }
        };

        let change = lock(&self.roster).apply(
            &event.pubkey,
            event.created_at,
            &announcement,
            self.clock.now_millis(),
        );
        self.notify(&change);
        change
    }

    fn sweep(&self) -> RosterChange {
        let change = lock(&self.roster).sweep(self.clock.now_millis());
        self.notify(&change);
        change
    }

    fn notify(&self, change: &RosterChange) {
        if !change.is_empty() {
            let _ = self.changes.send(change.clone());
        }
    }

    async fn heartbeat(&self) -> Result<Option<SignedEvent>, CollabError> {
        if lock(&self.local).state.is_none() {
            return Ok(None);
        }
        self.publish_local(true).await
    }

    /// Publishes the local state. A forced publish leaves the dedup
    /// baseline untouched.
    async fn publish_local(&self, force: bool) -> Result<Option<SignedEvent>, CollabError> {
        let now = self.clock.now_secs();
        let content = {
            let mut local = lock(&self.local);
            if !force {
                let serialized = serde_json::to_string(&local.state)?;
                if local.last_sent.as_deref() == Some(serialized.as_str()) {
                    return Ok(None);
                }
                local.last_sent = Some(serialized);
            }
            PresenceAnnouncement {
                client_id: self.local_client_id,
                state: local.state.clone(),
                ts: now,
            }
            .to_json()?
        };

        let unsigned =
            UnsignedEvent::new(EventKind::Presence, content, now).with_document(&self.document_id);
        let event = sign_and_publish(self.signer.as_ref(), self.transport.as_ref(), unsigned).await?;
        Ok(Some(event))
    }
}

// ─── Background tasks ───────────────────────────────────────────────

async fn inbound_loop(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(message) = inbound.recv().await {
        match message {
            InboundEvent::Event { event, .. } => {
                inner.handle_event(&event);
            }
            InboundEvent::EndOfStoredEvents { relay } => {
                log::debug!("Presence replay for {} done on {relay}", inner.document_id);
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn heartbeat_loop(inner: Arc<Inner>, period: Duration) {
    let mut ticker = ticker(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = inner.heartbeat().await {
            log::warn!("Presence heartbeat for {} failed: {e}", inner.document_id);
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, period: Duration) {
    let mut ticker = ticker(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        inner.sweep();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

//! Document replication channel: binds one CRDT document to the relays.
//!
//! ```text
//!  local edit ──► Doc ──observe──► outbound task ──► publish task ──► sign ──► Transport::publish
//!                  ▲                    │ (Local origin only)
//!                  │                    └──► Persistence::save
//!                  │
//!  Transport ──► inbound task ──► ingest ──┬─ 9337  merge (Remote)
//!                                          ├─ 31338 cache + merge (Historical)
//!                                          └─ 9338  cache only
//! ```
//!
//! Lifecycle: `Initializing → Syncing → Live → Closed`. The channel turns
//! live on the first end-of-stored-events from any relay.
//!
//! Every network-originated merge is tagged so it can never be
//! re-published. Local changes publish once each, in commit order: a single
//! task awaits each publish before starting the next. There is no batching
//! or debouncing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Transact, Update};

use crate::clock::{Clock, SystemClock};
use crate::config::SnapshotConfig;
use crate::event::{SignedEvent, UnsignedEvent};
use crate::identity::Signer;
use crate::origin::TxnOrigin;
use crate::payload::{self, Payload};
use crate::protocol::{EventKind, Filter};
use crate::snapshot::{self, SnapshotCache, SnapshotKind};
use crate::storage::Persistence;
use crate::transport::{sign_and_publish, InboundEvent, SubscriptionId, Transport};
use crate::CollabError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Initializing,
    Syncing,
    Live,
    Closed,
}

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    SnapshotMerged,
    SnapshotCached,
    DuplicateSnapshot,
}

pub struct DocumentOptions {
    pub document_id: String,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub clock: Arc<dyn Clock>,
    pub snapshot: SnapshotConfig,
    pub store: Option<Arc<dyn Persistence>>,
    /// Bind an existing document instead of creating a fresh one.
    pub doc: Option<Doc>,
}

impl DocumentOptions {
    pub fn new(
        document_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            transport,
            signer,
            clock: Arc::new(SystemClock),
            snapshot: SnapshotConfig::default(),
            store: None,
            doc: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_snapshots(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_doc(mut self, doc: Doc) -> Self {
        self.doc = Some(doc);
        self
    }
}

struct CommittedUpdate {
    origin: TxnOrigin,
    update: Vec<u8>,
}

struct Inner {
    document_id: String,
    doc: Doc,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn Persistence>>,
    state: watch::Sender<ChannelState>,
    snapshots: Mutex<SnapshotCache>,
    snapshot_list: watch::Sender<Vec<SignedEvent>>,
    /// Local changes since the last saved snapshot.
    dirty: AtomicBool,
}

pub struct DocumentChannel {
    inner: Arc<Inner>,
    subscription: Option<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
    updates: Option<yrs::Subscription>,
}

impl DocumentChannel {
    /// Restores any cached state, starts observing local commits and
    /// subscribes to the document's live and snapshot events.
    pub async fn open(options: DocumentOptions) -> Result<Self, CollabError> {
        let DocumentOptions {
            document_id,
            transport,
            signer,
            clock,
            snapshot,
            store,
            doc,
        } = options;

        let (state, _) = watch::channel(ChannelState::Initializing);
        let (snapshot_list, _) = watch::channel(Vec::new());
        let inner = Arc::new(Inner {
            document_id,
            doc: doc.unwrap_or_else(Doc::new),
            transport,
            signer,
            clock,
            store,
            state,
            snapshots: Mutex::new(SnapshotCache::new()),
            snapshot_list,
            dirty: AtomicBool::new(false),
        });

        inner.restore();

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let updates = inner
            .doc
            .observe_update_v1(move |txn, event| {
                let _ = update_tx.send(CommittedUpdate {
                    origin: TxnOrigin::of(txn),
                    update: event.update.clone(),
                });
            })
            .map_err(|e| CollabError::Crdt(format!("cannot observe document updates: {e:?}")))?;
        // Both end by themselves once the observer is dropped and the queues drain.
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        tokio::spawn(outbound_loop(inner.clone(), update_rx, publish_tx));
        tokio::spawn(publish_loop(inner.clone(), publish_rx));

        let (sink, inbound_rx) = mpsc::unbounded_channel();
        let filter = Filter::new()
            .kinds([
                EventKind::LiveUpdate,
                EventKind::ReplaceableSnapshot,
                EventKind::SnapshotHistory,
            ])
            .document(inner.document_id.clone());
        let subscription = inner.transport.subscribe(filter, sink)?;
        inner.advance(ChannelState::Syncing);
        log::info!("Document {} syncing", inner.document_id);

        let mut tasks = vec![tokio::spawn(inbound_loop(inner.clone(), inbound_rx))];
        if let Some(period) = snapshot.interval() {
            tasks.push(tokio::spawn(snapshot_loop(inner.clone(), period, snapshot.kind)));
        }

        Ok(Self {
            inner,
            subscription: Some(subscription),
            tasks,
            updates: Some(updates),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.inner.document_id
    }

    /// The shared CRDT document. Edits made through it are published.
    pub fn doc(&self) -> &Doc {
        &self.inner.doc
    }

    pub fn client_id(&self) -> u64 {
        self.inner.doc.client_id()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Resolves once a relay has finished replaying stored events.
    pub async fn wait_until_live(&self) -> Result<(), CollabError> {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ChannelState::Live => return Ok(()),
                ChannelState::Closed => return Err(CollabError::Closed),
                ChannelState::Initializing | ChannelState::Syncing => {}
            }
            state.changed().await.map_err(|_| CollabError::Closed)?;
        }
    }

    /// Feeds one relay event through the inbound path.
    pub fn ingest(&self, event: &SignedEvent) -> Result<IngestOutcome, CollabError> {
        self.inner.ingest(event)
    }

    /// Publishes the full current state as a snapshot of `kind`.
    pub async fn save_snapshot(&self, kind: SnapshotKind) -> Result<SignedEvent, CollabError> {
        self.inner.save_snapshot(kind).await
    }

    /// Merges a snapshot's state into the document. Merging never
    /// discards concurrent edits; it is a union, not a rollback.
    pub fn apply_snapshot(&self, event: &SignedEvent) -> Result<(), CollabError> {
        let outcome = self.inner.apply_snapshot(event);
        if let Err(e) = &outcome {
            log::error!("Applying snapshot {} failed: {e}", event.id);
        }
        outcome
    }

    /// Known snapshots, newest first.
    pub fn snapshots(&self) -> Vec<SignedEvent> {
        self.inner.lock_snapshots().list()
    }

    /// Receives the full snapshot list whenever a new snapshot appears.
    pub fn watch_snapshots(&self) -> watch::Receiver<Vec<SignedEvent>> {
        self.inner.snapshot_list.subscribe()
    }

    /// Stops listening. Publishes already in flight are allowed to finish.
    pub fn close(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.inner.transport.unsubscribe(&id);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.updates.take();
        if self.inner.advance(ChannelState::Closed) {
            log::info!("Document {} closed", self.inner.document_id);
        }
    }
}

impl Drop for DocumentChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn lock_snapshots(&self) -> MutexGuard<'_, SnapshotCache> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves forward only; returns whether the state changed.
    fn advance(&self, next: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if next <= *current {
                return false;
            }
            *current = next;
            true
        })
    }

    fn merge(&self, update: Update, origin: TxnOrigin) -> Result<(), CollabError> {
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| CollabError::Crdt(e.to_string()))
    }

    fn restore(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load(&self.document_id) {
            Ok(Some(state)) => {
                let restored = Update::decode_v1(&state)
                    .map_err(|e| CollabError::Crdt(e.to_string()))
                    .and_then(|update| self.merge(update, TxnOrigin::Historical));
                match restored {
                    Ok(()) => log::info!(
                        "Restored {} bytes of cached state for {}",
                        state.len(),
                        self.document_id
                    ),
                    Err(e) => log::warn!("Ignoring cached state for {}: {e}", self.document_id),
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Loading cached state for {} failed: {e}", self.document_id),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let state = snapshot::encode_full_state(&self.doc);
        if let Err(e) = store.save(&self.document_id, &state) {
            log::warn!("Caching state for {} failed: {e}", self.document_id);
        }
    }

    fn ingest(&self, event: &SignedEvent) -> Result<IngestOutcome, CollabError> {
        if event.document_tag() != Some(self.document_id.as_str()) {
            return Err(CollabError::ForeignDocument {
                expected: self.document_id.clone(),
                found: event.document_tag().map(str::to_string),
            });
        }

        match Payload::decode(event)? {
            Payload::Update(update) => {
                self.merge(update, TxnOrigin::Remote)?;
                Ok(IngestOutcome::Applied)
            }
            Payload::Snapshot { kind: SnapshotKind::Replaceable, update } => {
                if self.lock_snapshots().get(&event.id).is_some() {
                    return Ok(IngestOutcome::DuplicateSnapshot);
                }
                // Cached only once merged, so a failed merge is retried on redelivery.
                self.merge(update, TxnOrigin::Historical)?;
                self.remember_snapshot(event);
                Ok(IngestOutcome::SnapshotMerged)
            }
            Payload::Snapshot { kind: SnapshotKind::History, .. } => {
                if !self.remember_snapshot(event) {
                    return Ok(IngestOutcome::DuplicateSnapshot);
                }
                Ok(IngestOutcome::SnapshotCached)
            }
            Payload::Presence(_) => Err(CollabError::UnexpectedKind(event.kind.as_u32())),
        }
    }

    fn apply_snapshot(&self, event: &SignedEvent) -> Result<(), CollabError> {
        if !event.kind.is_snapshot() {
            return Err(CollabError::NotASnapshot(event.kind.as_u32()));
        }
        match Payload::decode(event)? {
            Payload::Snapshot { update, .. } => self.merge(update, TxnOrigin::Historical),
            Payload::Update(_) | Payload::Presence(_) => {
                Err(CollabError::NotASnapshot(event.kind.as_u32()))
            }
        }
    }

    fn announce_snapshots(&self) {
        let list = self.lock_snapshots().list();
        self.snapshot_list.send_replace(list);
    }

    /// Caches `event` and announces the new list; false if already known.
    fn remember_snapshot(&self, event: &SignedEvent) -> bool {
        if !self.lock_snapshots().insert(event.clone()) {
            return false;
        }
        self.announce_snapshots();
        true
    }

    async fn publish_update(&self, update: Vec<u8>) -> Result<SignedEvent, CollabError> {
        let unsigned = UnsignedEvent::new(
            EventKind::LiveUpdate,
            payload::encode_binary(&update),
            self.clock.now_secs(),
        )
        .with_document(&self.document_id);
        sign_and_publish(self.signer.as_ref(), self.transport.as_ref(), unsigned).await
    }

    async fn save_snapshot(&self, kind: SnapshotKind) -> Result<SignedEvent, CollabError> {
        let was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        let state = snapshot::encode_full_state(&self.doc);
        let unsigned = UnsignedEvent::new(
            kind.event_kind(),
            payload::encode_binary(&state),
            self.clock.now_secs(),
        )
        .with_document(&self.document_id);

        match sign_and_publish(self.signer.as_ref(), self.transport.as_ref(), unsigned).await {
            Ok(event) => {
                self.remember_snapshot(&event);
                log::info!("Saved {kind:?} snapshot {} for {}", event.id, self.document_id);
                Ok(event)
            }
            Err(e) => {
                if was_dirty {
                    self.dirty.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }
}

// ─── Background tasks ───────────────────────────────────────────────

async fn outbound_loop(
    inner: Arc<Inner>,
    mut updates: mpsc::UnboundedReceiver<CommittedUpdate>,
    publish: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(first) = updates.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = updates.try_recv() {
            batch.push(next);
        }

        for CommittedUpdate { origin, update } in batch {
            if !origin.is_published() {
                continue;
            }
            inner.dirty.store(true, Ordering::SeqCst);
            if publish.send(update).is_err() {
                log::warn!("Publish task for {} is gone", inner.document_id);
            }
        }

        inner.persist();
    }
}

/// Publishes local updates one at a time, in commit order.
async fn publish_loop(inner: Arc<Inner>, mut updates: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(update) = updates.recv().await {
        // Failures are logged by sign_and_publish; local state is kept.
        let _ = inner.publish_update(update).await;
    }
}

async fn inbound_loop(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(message) = inbound.recv().await {
        match message {
            InboundEvent::Event { relay, event } => match inner.ingest(&event) {
                Ok(outcome) => log::debug!("{outcome:?}: event {} from {relay}", event.id),
                Err(e) => log::debug!("Discarding event {} from {relay}: {e}", event.id),
            },
            InboundEvent::EndOfStoredEvents { relay } => {
                if inner.advance(ChannelState::Live) {
                    log::info!("Document {} live after replay from {relay}", inner.document_id);
                }
            }
        }
    }
}

async fn snapshot_loop(inner: Arc<Inner>, period: Duration, kind: SnapshotKind) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !inner.dirty.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = inner.save_snapshot(kind).await {
            log::warn!("Periodic snapshot of {} failed: {e}", inner.document_id);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

//! Refcounted connection registry and the relay-set transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::connection::RelayConnection;
use crate::config::RelayConfig;
use crate::event::SignedEvent;
use crate::protocol::Filter;
use crate::transport::{
    new_subscription_id, EventSink, PublishError, PublishReceipt, SubscribeError, SubscriptionId,
    Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolEntry {
    connection: Arc<RelayConnection>,
    refs: usize,
}

/// One connection per URL, shared by every session that asks for it.
///
/// The last [`RelayPool::release`] for a URL closes its connection.
pub struct RelayPool {
    config: RelayConfig,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl RelayPool {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the connection for `url`, opening it on first use.
    pub fn acquire(&self, url: &str) -> Arc<RelayConnection> {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(url.to_string()).or_insert_with(|| {
            log::info!("Opening relay connection to {url}");
            PoolEntry {
                connection: Arc::new(RelayConnection::spawn(url, self.config.clone())),
                refs: 0,
            }
        });
        entry.refs += 1;
        entry.connection.clone()
    }

    pub fn release(&self, url: &str) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(url) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(entry) = entries.remove(url) {
                entry.connection.close();
            }
        }
    }

    pub fn ref_count(&self, url: &str) -> usize {
        lock(&self.entries).get(url).map_or(0, |entry| entry.refs)
    }

    pub fn close_all(&self) {
        for (_, entry) in lock(&self.entries).drain() {
            entry.connection.close();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

/// A fixed list of relays used together as one [`Transport`].
///
/// Publishing fans out to every relay and resolves on the first
/// acceptance; the remaining sends keep running in the background.
pub struct RelaySet {
    pool: Arc<RelayPool>,
    connections: Vec<Arc<RelayConnection>>,
    subscriptions: Mutex<HashSet<SubscriptionId>>,
    released: AtomicBool,
}

impl RelaySet {
    pub fn new(pool: Arc<RelayPool>, urls: &[String]) -> Self {
        let mut seen = HashSet::new();
        let connections = urls
            .iter()
            .filter(|url| seen.insert(url.as_str()))
            .map(|url| pool.acquire(url))
            .collect();
        Self {
            pool,
            connections,
            subscriptions: Mutex::new(HashSet::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        self.connections.iter().map(|c| c.url()).collect()
    }

    pub fn connections(&self) -> &[Arc<RelayConnection>] {
        &self.connections
    }

    /// Closes this set's subscriptions and releases its pool references.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions: Vec<SubscriptionId> = lock(&self.subscriptions).drain().collect();
        for connection in &self.connections {
            for id in &subscriptions {
                connection.unsubscribe(id);
            }
            self.pool.release(connection.url());
        }
    }
}

impl Drop for RelaySet {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for RelaySet {
    async fn publish(&self, event: &SignedEvent) -> Result<PublishReceipt, PublishError> {
        if self.connections.is_empty() {
            return Err(PublishError::NoRelays);
        }

        let (results_tx, mut results) = mpsc::unbounded_channel();
        for connection in &self.connections {
            let connection = connection.clone();
            let event = event.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let outcome = connection.publish(&event).await;
                let _ = results_tx.send((connection.url().to_string(), outcome));
            });
        }
        drop(results_tx);

        let mut failures = Vec::new();
        while let Some((relay, outcome)) = results.recv().await {
            match outcome {
                Ok(()) => {
                    return Ok(PublishReceipt { relay, event_id: event.id.clone() });
                }
                Err(e) => {
                    log::warn!("Relay {relay} did not accept {}: {e}", event.id);
                    failures.push((relay, e));
                }
            }
        }
        Err(PublishError::AllRelaysFailed(failures))
    }

    fn subscribe(&self, filter: Filter, sink: EventSink) -> Result<SubscriptionId, SubscribeError> {
        if self.connections.is_empty() {
            return Err(SubscribeError::NoRelays);
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(SubscribeError::Closed);
        }

        let id = new_subscription_id();
        for connection in &self.connections {
            if let Err(e) = connection.subscribe(id.clone(), filter.clone(), sink.clone()) {
                log::warn!("Subscribe {id} on {} failed: {e}", connection.url());
            }
        }
        lock(&self.subscriptions).insert(id.clone());
        log::info!("Subscription {id} issued to {} relays", self.connections.len());
        Ok(id)
    }

    fn unsubscribe(&self, id: &SubscriptionId) {
        if lock(&self.subscriptions).remove(id) {
            for connection in &self.connections {
                connection.unsubscribe(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AckPolicy;
    use crate::event::UnsignedEvent;
    use crate::identity::Keys;
    use crate::protocol::EventKind;
    use crate::relay::{ConnectionState, RelayError};

    fn unreachable_config() -> RelayConfig {
        RelayConfig {
            reconnect_delay_ms: 20,
            publish_timeout_ms: 100,
            ack: AckPolicy::Acknowledged,
        }
    }

    #[tokio::test]
    async fn test_pool_refcounts_connections() {
        let pool = RelayPool::new(unreachable_config());
        let a = pool.acquire("ws://127.0.0.1:1");
        let b = pool.acquire("ws://127.0.0.1:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.ref_count("ws://127.0.0.1:1"), 2);

        pool.release("ws://127.0.0.1:1");
        assert_eq!(pool.ref_count("ws://127.0.0.1:1"), 1);
        assert_ne!(a.state(), ConnectionState::Closed);

        pool.release("ws://127.0.0.1:1");
        assert!(pool.is_empty());
        assert_eq!(a.state(), ConnectionState::Closed);

        // Releasing an unknown URL is a no-op.
        pool.release("ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_relay_sets_share_pool_entries() {
        let pool = Arc::new(RelayPool::new(unreachable_config()));
        let urls = vec!["ws://127.0.0.1:1".to_string(), "ws://127.0.0.1:2".to_string()];
        let first = RelaySet::new(pool.clone(), &urls);
        let second = RelaySet::new(pool.clone(), &urls[..1]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.ref_count("ws://127.0.0.1:1"), 2);

        first.close();
        first.close();
        assert_eq!(pool.ref_count("ws://127.0.0.1:1"), 1);
        assert_eq!(pool.ref_count("ws://127.0.0.1:2"), 0);

        drop(second);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_urls_acquired_once() {
        let pool = Arc::new(RelayPool::new(unreachable_config()));
        let urls = vec!["ws://127.0.0.1:1".to_string(), "ws://127.0.0.1:1".to_string()];
        let set = RelaySet::new(pool.clone(), &urls);
        assert_eq!(set.urls(), vec!["ws://127.0.0.1:1"]);
        assert_eq!(pool.ref_count("ws://127.0.0.1:1"), 1);
    }

    #[tokio::test]
    async fn test_empty_set_fails_fast() {
        let pool = Arc::new(RelayPool::new(unreachable_config()));
        let set = RelaySet::new(pool, &[]);
        let event = Keys::generate()
            .sign(UnsignedEvent::new(EventKind::LiveUpdate, "", 1))
            .unwrap();
        assert!(matches!(set.publish(&event).await, Err(PublishError::NoRelays)));
        let (sink, _rx) = mpsc::unbounded_channel();
        assert!(matches!(set.subscribe(Filter::new(), sink), Err(SubscribeError::NoRelays)));
    }

    #[tokio::test]
    async fn test_publish_fails_when_every_relay_fails() {
        let pool = Arc::new(RelayPool::new(unreachable_config()));
        let urls = vec!["ws://127.0.0.1:1".to_string(), "ws://127.0.0.1:2".to_string()];
        let set = RelaySet::new(pool, &urls);
        let event = Keys::generate()
            .sign(UnsignedEvent::new(EventKind::LiveUpdate, "", 1))
            .unwrap();

        match set.publish(&event).await {
            Err(PublishError::AllRelaysFailed(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|(_, e)| matches!(e, RelayError::Timeout(_))));
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_set_refuses_subscriptions() {
        let pool = Arc::new(RelayPool::new(unreachable_config()));
        let set = RelaySet::new(pool, &["ws://127.0.0.1:1".to_string()]);
        let (sink, _rx) = mpsc::unbounded_channel();
        let id = set.subscribe(Filter::new(), sink.clone()).unwrap();
        assert_eq!(set.connections()[0].subscription_count(), 1);
        set.unsubscribe(&id);
        assert_eq!(set.connections()[0].subscription_count(), 0);

        set.close();
        assert!(matches!(set.subscribe(Filter::new(), sink), Err(SubscribeError::Closed)));
    }
}

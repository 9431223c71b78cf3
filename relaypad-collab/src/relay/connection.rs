//! A single relay connection with automatic reconnect.
//!
//! One background task owns the socket. It:
//! - reconnects after a fixed delay whenever the socket drops,
//! - re-issues every registered subscription right after connecting,
//! - drains the outbound frame queue while open (frames queued while
//!   disconnected stay queued and go out once, after reconnect),
//! - routes EVENT/EOSE to subscription sinks and OK to pending publishes.
//!
//! Signing is deterministic, so the same event can be in flight twice.
//! Every publish waiting on an event id is answered by its first OK.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::RelayError;
use crate::config::{AckPolicy, RelayConfig};
use crate::event::SignedEvent;
use crate::protocol::{ClientMessage, Filter, RelayMessage};
use crate::transport::{EventSink, InboundEvent, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Disconnected,
    Closed,
}

struct Registered {
    filter: Filter,
    sink: EventSink,
}

/// A relay's answer to one EVENT.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ack {
    Accepted,
    Rejected(String),
}

struct AckWaiter {
    id: u64,
    sender: oneshot::Sender<Ack>,
}

/// Frames above this many waiting for a socket are worth a warning.
const BACKLOG_WARNING: usize = 1_000;

/// State shared between the connection handle and its socket task.
struct Shared {
    url: Arc<str>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<HashMap<SubscriptionId, Registered>>,
    pending_acks: Mutex<HashMap<String, Vec<AckWaiter>>>,
    next_waiter: AtomicU64,
    /// Frames sent to the socket task but not yet written.
    queued: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(url: &str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            url: Arc::from(url),
            state,
            subscriptions: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    fn await_ack(&self, event_id: &str) -> (u64, oneshot::Receiver<Ack>) {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending_acks)
            .entry(event_id.to_string())
            .or_default()
            .push(AckWaiter { id, sender });
        (id, receiver)
    }

    /// Drops one waiter, leaving other publishes of the same event waiting.
    fn forget_ack(&self, event_id: &str, waiter: u64) {
        let mut pending = lock(&self.pending_acks);
        if let Some(waiters) = pending.get_mut(event_id) {
            waiters.retain(|w| w.id != waiter);
            if waiters.is_empty() {
                pending.remove(event_id);
            }
        }
    }

    /// Closed is terminal; late updates from a dying task are ignored.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn subscription_frames(&self) -> Vec<String> {
        lock(&self.subscriptions)
            .iter()
            .filter_map(|(id, registered)| {
                ClientMessage::Req { subscription_id: id.clone(), filter: registered.filter.clone() }
                    .to_json()
                    .map_err(|e| log::warn!("Cannot encode REQ {id} for {}: {e}", self.url))
                    .ok()
            })
            .collect()
    }

    fn dispatch(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping frame from {}: {e}", self.url);
                return;
            }
        };

        match message {
            RelayMessage::Event { subscription_id, event } => {
                self.forward(&subscription_id, InboundEvent::Event { relay: self.url.clone(), event });
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                self.forward(&subscription_id, InboundEvent::EndOfStoredEvents { relay: self.url.clone() });
            }
            RelayMessage::Notice(notice) => {
                log::warn!("NOTICE from {}: {notice}", self.url);
            }
            RelayMessage::Ok { event_id, accepted, message } => {
                let Some(waiters) = lock(&self.pending_acks).remove(&event_id) else {
                    log::debug!("Unmatched OK for {event_id} from {}", self.url);
                    return;
                };
                let ack = if accepted {
                    Ack::Accepted
                } else {
                    log::warn!("Relay {} rejected {event_id}: {message}", self.url);
                    Ack::Rejected(message)
                };
                for waiter in waiters {
                    let _ = waiter.sender.send(ack.clone());
                }
            }
            RelayMessage::Closed { subscription_id, message } => {
                log::warn!("Relay {} closed subscription {subscription_id}: {message}", self.url);
            }
        }
    }

    fn forward(&self, subscription_id: &str, message: InboundEvent) {
        match lock(&self.subscriptions).get(subscription_id) {
            Some(registered) => {
                let _ = registered.sink.send(message);
            }
            None => log::debug!("Dropping message for unknown subscription {subscription_id}"),
        }
    }
}

/// Handle to one relay. Cheap to share behind an `Arc`.
pub struct RelayConnection {
    shared: Arc<Shared>,
    config: RelayConfig,
    outbound: mpsc::UnboundedSender<String>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Starts the socket task. Must be called inside a tokio runtime.
    pub fn spawn(url: &str, config: RelayConfig) -> Self {
        let shared = Arc::new(Shared::new(url));
        let (outbound, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(shared.clone(), config.reconnect_delay(), queue));
        Self {
            shared,
            config,
            outbound,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the socket is open, or fails if the connection is closed.
    pub async fn wait_open(&self) -> Result<(), RelayError> {
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed => return Err(RelayError::Closed),
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }
            if state.changed().await.is_err() {
                return Err(RelayError::Closed);
            }
        }
    }

    /// Registers a subscription. It is (re-)issued on every connect; if
    /// the socket is open right now the REQ goes out immediately.
    pub fn subscribe(
        &self,
        id: SubscriptionId,
        filter: Filter,
        sink: EventSink,
    ) -> Result<(), RelayError> {
        let frame = ClientMessage::Req { subscription_id: id.clone(), filter: filter.clone() }.to_json()?;
        lock(&self.shared.subscriptions).insert(id, Registered { filter, sink });
        if self.state() == ConnectionState::Open {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: &str) {
        let removed = lock(&self.shared.subscriptions).remove(id).is_some();
        if removed && self.state() == ConnectionState::Open {
            match ClientMessage::Close(id.to_string()).to_json() {
                Ok(frame) => {
                    let _ = self.send_frame(frame);
                }
                Err(e) => log::warn!("Cannot encode CLOSE {id}: {e}"),
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Frames waiting for the socket, e.g. publishes made while offline.
    pub fn queued_frames(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Sends `event` and waits for acceptance according to the ack policy.
    pub async fn publish(&self, event: &SignedEvent) -> Result<(), RelayError> {
        let frame = ClientMessage::Event(event.clone()).to_json()?;
        let timeout = self.config.publish_timeout();

        match self.config.ack {
            AckPolicy::Sent => {
                tokio::time::timeout(timeout, self.wait_open())
                    .await
                    .map_err(|_| RelayError::Timeout(timeout))??;
                self.send_frame(frame)
            }
            AckPolicy::Acknowledged => {
                let (waiter, ack_rx) = self.shared.await_ack(&event.id);
                if let Err(e) = self.send_frame(frame) {
                    self.shared.forget_ack(&event.id, waiter);
                    return Err(e);
                }
                match tokio::time::timeout(timeout, ack_rx).await {
                    Ok(Ok(Ack::Accepted)) => Ok(()),
                    Ok(Ok(Ack::Rejected(message))) => Err(RelayError::Rejected(message)),
                    Ok(Err(_)) => Err(RelayError::Closed),
                    Err(_) => {
                        self.shared.forget_ack(&event.id, waiter);
                        Err(RelayError::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Stops the socket task. Pending publishes fail with [`RelayError::Closed`].
    pub fn close(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.shared.set_state(ConnectionState::Closed);
        lock(&self.shared.pending_acks).clear();
        lock(&self.shared.subscriptions).clear();
        log::info!("Closed relay connection {}", self.shared.url);
    }

    fn send_frame(&self, frame: String) -> Result<(), RelayError> {
        // Counted before the send so the socket task never sees it negative.
        let queued = self.shared.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.outbound.send(frame).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::Closed);
        }
        if queued == BACKLOG_WARNING {
            log::warn!("{queued} frames waiting for relay {}", self.shared.url);
        }
        Ok(())
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

// ─── Socket task ────────────────────────────────────────────────────

async fn run(
    shared: Arc<Shared>,
    reconnect_delay: Duration,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    loop {
        shared.set_state(ConnectionState::Connecting);

        match tokio_tungstenite::connect_async(shared.url.as_ref()).await {
            Ok((stream, _)) => {
                log::info!("Connected to relay {}", shared.url);
                let (mut writer, mut reader) = stream.split();
                shared.set_state(ConnectionState::Open);

                let backlog = shared.queued.load(Ordering::SeqCst);
                if backlog > 0 {
                    log::info!("Flushing {backlog} queued frames to {}", shared.url);
                }

                let mut healthy = true;
                for frame in shared.subscription_frames() {
                    if let Err(e) = writer.send(Message::Text(frame.into())).await {
                        log::warn!("Re-subscribe on {} failed: {e}", shared.url);
                        healthy = false;
                        break;
                    }
                }

                while healthy {
                    tokio::select! {
                        frame = queue.recv() => match frame {
                            Some(frame) => {
                                shared.queued.fetch_sub(1, Ordering::SeqCst);
                                if let Err(e) = writer.send(Message::Text(frame.into())).await {
                                    log::warn!("Write to {} failed: {e}", shared.url);
                                    healthy = false;
                                }
                            }
                            None => {
                                // Handle dropped; nothing left to send.
                                let _ = writer.close().await;
                                shared.set_state(ConnectionState::Closed);
                                return;
                            }
                        },
                        message = reader.next() => match message {
                            Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Relay {} closed the connection", shared.url);
                                healthy = false;
                            }
                            Some(Err(e)) => {
                                log::warn!("Read from {} failed: {e}", shared.url);
                                healthy = false;
                            }
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
            Err(e) => log::warn!("Failed to connect to relay {}: {e}", shared.url),
        }

        shared.set_state(ConnectionState::Disconnected);
        tokio::time::sleep(reconnect_delay).await;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;
    use crate::identity::Keys;
    use crate::protocol::EventKind;

    fn signed() -> SignedEvent {
        Keys::generate()
            .sign(UnsignedEvent::new(EventKind::LiveUpdate, "AA==", 1).with_document("d"))
            .unwrap()
    }

    fn register(shared: &Shared, id: &str) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (sink, rx) = mpsc::unbounded_channel();
        lock(&shared.subscriptions)
            .insert(id.to_string(), Registered { filter: Filter::new(), sink });
        rx
    }

    #[test]
    fn test_dispatch_routes_events_by_subscription() {
        let shared = Shared::new("ws://relay.test");
        let mut rx = register(&shared, "sub-a");
        let event = signed();

        let frame = RelayMessage::Event { subscription_id: "sub-a".into(), event: event.clone() }
            .to_json()
            .unwrap();
        shared.dispatch(&frame);
        shared.dispatch(&RelayMessage::EndOfStoredEvents("sub-a".into()).to_json().unwrap());
        let other = RelayMessage::Event { subscription_id: "sub-b".into(), event }.to_json().unwrap();
        shared.dispatch(&other);

        match rx.try_recv().unwrap() {
            InboundEvent::Event { relay, event: received } => {
                assert_eq!(&*relay, "ws://relay.test");
                assert_eq!(received.content, "AA==");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), InboundEvent::EndOfStoredEvents { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_resolves_acks() {
        let shared = Shared::new("ws://relay.test");
        let (_, mut ok_rx) = shared.await_ack("e1");
        let (_, mut rejected_rx) = shared.await_ack("e2");

        shared.dispatch(r#"["OK","e1",true,""]"#);
        shared.dispatch(r#"["OK","e2",false,"rate-limited"]"#);
        shared.dispatch(r#"["OK","e3",true,""]"#);

        assert_eq!(ok_rx.try_recv().unwrap(), Ack::Accepted);
        assert_eq!(rejected_rx.try_recv().unwrap(), Ack::Rejected("rate-limited".into()));
        assert!(lock(&shared.pending_acks).is_empty());
    }

    #[test]
    fn test_one_ok_answers_every_waiter_for_an_event() {
        let shared = Shared::new("ws://relay.test");
        let (_, mut first) = shared.await_ack("same");
        let (second_id, mut second) = shared.await_ack("same");
        let (_, mut third) = shared.await_ack("same");

        // A timed-out waiter leaves the others in place.
        shared.forget_ack("same", second_id);
        assert!(second.try_recv().is_err());
        assert_eq!(lock(&shared.pending_acks)["same"].len(), 2);

        shared.dispatch(r#"["OK","same",true,""]"#);
        assert_eq!(first.try_recv().unwrap(), Ack::Accepted);
        assert_eq!(third.try_recv().unwrap(), Ack::Accepted);
        assert!(lock(&shared.pending_acks).is_empty());
    }

    #[test]
    fn test_dispatch_ignores_garbage() {
        let shared = Shared::new("ws://relay.test");
        let mut rx = register(&shared, "s");
        shared.dispatch("garbage");
        shared.dispatch(r#"["NOTICE","slow down"]"#);
        shared.dispatch(r#"["CLOSED","s","auth-required"]"#);
        shared.dispatch(r#"["EVENT","s",{"not":"an event"}]"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_state_is_terminal() {
        let shared = Shared::new("ws://relay.test");
        shared.set_state(ConnectionState::Open);
        shared.set_state(ConnectionState::Closed);
        shared.set_state(ConnectionState::Disconnected);
        assert_eq!(*shared.state.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn test_subscription_frames_cover_registrations() {
        let shared = Shared::new("ws://relay.test");
        let _a = register(&shared, "a");
        let _b = register(&shared, "b");
        let mut frames = shared.subscription_frames();
        frames.sort();
        assert_eq!(frames, vec![r#"["REQ","a",{}]"#, r#"["REQ","b",{}]"#]);
    }

    #[tokio::test]
    async fn test_publish_times_out_without_relay() {
        let config = RelayConfig {
            reconnect_delay_ms: 20,
            publish_timeout_ms: 100,
            ack: AckPolicy::Acknowledged,
        };
        let connection = RelayConnection::spawn("ws://127.0.0.1:1", config);
        let result = connection.publish(&signed()).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
        // The frame stays queued for the next connect.
        assert_eq!(connection.queued_frames(), 1);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(connection.wait_open().await, Err(RelayError::Closed)));
    }
}

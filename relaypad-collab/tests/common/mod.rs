//! In-process relay for integration tests.
//!
//! Speaks the REQ / CLOSE / EVENT subset: stores accepted events, replays
//! matches followed by EOSE, answers EVENT with OK and fans accepted
//! events out to every matching subscription, the publisher's included.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use relaypad_collab::{ClientMessage, Filter, RelayMessage, SignedEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Client {
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: HashMap<String, Filter>,
}

#[derive(Default)]
struct RelayState {
    events: Mutex<Vec<SignedEvent>>,
    clients: Mutex<HashMap<u64, Client>>,
    next_client: AtomicU64,
    received: AtomicUsize,
    reject: AtomicBool,
    silent: AtomicBool,
}

pub struct TestRelay {
    pub port: u16,
    state: Arc<RelayState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_on(free_port().await).await
    }

    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let state = Arc::new(RelayState::default());
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_tasks = tasks.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = tokio::spawn(serve(stream, accept_state.clone()));
                accept_tasks.lock().unwrap().push(connection);
            }
        });
        tasks.lock().unwrap().push(accept);

        Self { port, state, tasks }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Accepted events, in arrival order.
    pub fn events(&self) -> Vec<SignedEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// EVENT frames received, accepted or not.
    pub fn received(&self) -> usize {
        self.state.received.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .clients
            .lock()
            .unwrap()
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }

    /// Answer every EVENT with `OK false`.
    pub fn set_reject(&self, reject: bool) {
        self.state.reject.store(reject, Ordering::SeqCst);
    }

    /// Accept events without answering OK.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Stores an event without anyone publishing it.
    pub fn seed(&self, event: SignedEvent) {
        self.state.events.lock().unwrap().push(event);
    }

    /// Drops the listener and every open socket.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.state.clients.lock().unwrap().clear();
    }

    pub async fn wait_for_subscriptions(&self, count: usize) {
        timeout(Duration::from_secs(5), async {
            while self.subscription_count() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never saw the expected subscriptions");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut writer, mut reader) = socket.split();
    let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
    let client_id = state.next_client.fetch_add(1, Ordering::SeqCst);
    state.clients.lock().unwrap().insert(
        client_id,
        Client {
            outbound,
            subscriptions: HashMap::new(),
        },
    );

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if writer.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => handle(&state, client_id, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.clients.lock().unwrap().remove(&client_id);
}

fn send(state: &RelayState, client_id: u64, message: RelayMessage) {
    if let Some(client) = state.clients.lock().unwrap().get(&client_id) {
        let _ = client.outbound.send(message.to_json().unwrap());
    }
}

fn handle(state: &RelayState, client_id: u64, text: &str) {
    let Ok(message) = ClientMessage::from_json(text) else {
        send(state, client_id, RelayMessage::Notice("could not parse frame".into()));
        return;
    };

    match message {
        ClientMessage::Req { subscription_id, filter } => {
            let mut stored: Vec<SignedEvent> = state
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();
            if let Some(limit) = filter.limit {
                stored.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                stored.truncate(limit);
            }
            if let Some(client) = state.clients.lock().unwrap().get_mut(&client_id) {
                client.subscriptions.insert(subscription_id.clone(), filter);
            }
            for event in stored {
                send(
                    state,
                    client_id,
                    RelayMessage::Event { subscription_id: subscription_id.clone(), event },
                );
            }
            send(state, client_id, RelayMessage::EndOfStoredEvents(subscription_id));
        }
        ClientMessage::Close(subscription_id) => {
            if let Some(client) = state.clients.lock().unwrap().get_mut(&client_id) {
                client.subscriptions.remove(&subscription_id);
            }
        }
        ClientMessage::Event(event) => {
            state.received.fetch_add(1, Ordering::SeqCst);
            let verdict = if state.reject.load(Ordering::SeqCst) {
                Err("blocked: test relay rejects everything".to_string())
            } else {
                event.verify().map_err(|e| format!("invalid: {e}"))
            };
            if !state.silent.load(Ordering::SeqCst) {
                send(
                    state,
                    client_id,
                    RelayMessage::Ok {
                        event_id: event.id.clone(),
                        accepted: verdict.is_ok(),
                        message: verdict.clone().err().unwrap_or_default(),
                    },
                );
            }
            if verdict.is_err() {
                return;
            }

            state.events.lock().unwrap().push(event.clone());
            for client in state.clients.lock().unwrap().values() {
                for (id, filter) in &client.subscriptions {
                    if filter.matches(&event) {
                        let frame = RelayMessage::Event {
                            subscription_id: id.clone(),
                            event: event.clone(),
                        };
                        let _ = client.outbound.send(frame.to_json().unwrap());
                    }
                }
            }
        }
    }
}

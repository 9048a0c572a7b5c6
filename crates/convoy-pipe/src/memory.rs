//! In-process broker with the same lossy publish/subscribe semantics as the
//! TCP transport. Used by tests and single-process deployments.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::auth;
use crate::pipe::{AgentConn, Message, Operation, PipeBackend, Subscription};

#[derive(Debug)]
struct MemorySubscriber {
    id: u64,
    prefixes: Mutex<HashSet<String>>,
    frames: mpsc::Sender<Message>,
}

/// An in-process broker pumping a [`PipeBackend`].
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    subscribers: Arc<Mutex<Vec<Arc<MemorySubscriber>>>>,
    responses: mpsc::Sender<Message>,
    next_id: Arc<AtomicU64>,
    queue: usize,
}

impl MemoryBroker {
    /// Start pumping `backend`. Requests fan out to attached agents,
    /// operations feed the global auth registry.
    #[must_use]
    pub fn start(backend: PipeBackend, queue: usize) -> Self {
        let PipeBackend {
            mut requests,
            responses,
            mut operations,
        } = backend;

        let subscribers: Arc<Mutex<Vec<Arc<MemorySubscriber>>>> = Arc::new(Mutex::new(Vec::new()));

        let fanout = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let subscribers = fanout.lock().expect("subscriber lock").clone();
                for subscriber in subscribers {
                    let matched = subscriber
                        .prefixes
                        .lock()
                        .expect("prefix lock")
                        .iter()
                        .any(|prefix| message.topic.starts_with(prefix.as_str()));
                    if !matched {
                        continue;
                    }
                    // Lossy on overflow, like the socket transport.
                    if subscriber.frames.try_send(message.clone()).is_err() {
                        debug!(topic = %message.topic, "dropped frame for slow subscriber");
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(operation) = operations.recv().await {
                match operation {
                    Operation::AuthAdd(keys) => {
                        auth::global().add_keys(
                            keys.iter().map(|(client, key)| (client.as_str(), key.as_str())),
                        );
                    }
                    Operation::AuthRemove(key) => auth::global().remove_key(&key),
                }
            }
        });

        Self {
            subscribers,
            responses,
            next_id: Arc::new(AtomicU64::new(0)),
            queue,
        }
    }

    /// Attach an agent with initial subscription prefixes.
    #[must_use]
    pub fn attach(&self, subscriptions: impl IntoIterator<Item = String>) -> AgentConn {
        let (incoming_tx, incoming_rx) = mpsc::channel(self.queue);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(self.queue);
        let (control_tx, mut control_rx) = mpsc::channel::<Subscription>(self.queue);

        let subscriber = Arc::new(MemorySubscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            prefixes: Mutex::new(subscriptions.into_iter().collect()),
            frames: incoming_tx,
        });
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(Arc::clone(&subscriber));

        let responses = self.responses.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let id = subscriber.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        if responses.send(message).await.is_err() {
                            break;
                        }
                    }
                    update = control_rx.recv() => {
                        let Some(update) = update else { break };
                        let mut prefixes = subscriber.prefixes.lock().expect("prefix lock");
                        match update {
                            Subscription::Add(prefix) => {
                                prefixes.insert(prefix);
                            }
                            Subscription::Remove(prefix) => {
                                prefixes.remove(&prefix);
                            }
                        }
                    }
                }
            }
            subscribers
                .lock()
                .expect("subscriber lock")
                .retain(|s| s.id != id);
        });

        AgentConn::from_parts(incoming_rx, outgoing_tx, control_tx)
    }
}

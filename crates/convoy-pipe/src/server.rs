//! Manager-side TCP broker.
//!
//! Two listening sockets mirror the reference PUB/SUB pair: agents connect
//! to the *publish* socket to receive topic-framed requests, and to the
//! *collect* socket to deliver responses. Frames are length-delimited; the
//! first frame on every connection is a JSON hello carrying the client's
//! Z85 public key (and, on the publish socket, its initial subscription
//! prefixes).
//!
//! Publishing is lossy by contract: a subscriber whose queue is full, or
//! that is not yet connected, simply misses the frame. The manager's
//! announce/send/confirm loop owns delivery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth;
use crate::error::PipeError;
use crate::framing::{decode_frame, encode_frame};
use crate::pipe::{Operation, PipeBackend};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct PipeServerConfig {
    /// Address agents subscribe on.
    pub publish_addr: SocketAddr,

    /// Address agents deliver responses on.
    pub collect_addr: SocketAddr,

    /// Whether curve-key admission is enforced.
    pub auth: bool,

    /// Per-subscriber outbound queue depth; overflow drops frames.
    pub subscriber_queue: usize,
}

impl PipeServerConfig {
    /// Configuration with authentication set from the `DISABLE_AUTH`
    /// environment toggle.
    #[must_use]
    pub fn from_env(publish_addr: SocketAddr, collect_addr: SocketAddr) -> Self {
        let disabled = auth::disabled_by_env();
        if disabled {
            warn!("AUTHENTICATION HAS BEEN DISABLED MANUALLY");
        }
        Self {
            publish_addr,
            collect_addr,
            auth: !disabled,
            subscriber_queue: 64,
        }
    }
}

/// First frame sent by every connecting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// The client's Z85 public key.
    pub key: String,

    /// Initial subscription prefixes (publish socket only).
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Subscription change sent by a client on the publish socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    /// `subscribe` or `unsubscribe`.
    pub op: SubscriptionOp,

    /// The topic prefix.
    pub prefix: String,
}

/// Subscription operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionOp {
    /// Add the prefix.
    Subscribe,

    /// Remove the prefix.
    Unsubscribe,
}

#[derive(Debug)]
struct Subscriber {
    prefixes: Vec<String>,
    frames: mpsc::Sender<Vec<u8>>,
}

/// A running broker.
#[derive(Debug)]
pub struct PipeServer {
    publish_addr: SocketAddr,
    collect_addr: SocketAddr,
    cancel: CancellationToken,
}

impl PipeServer {
    /// Bind both sockets and start the broker tasks.
    pub async fn start(
        config: PipeServerConfig,
        backend: PipeBackend,
    ) -> Result<Self, PipeError> {
        let publish_listener = TcpListener::bind(config.publish_addr).await?;
        let collect_listener = TcpListener::bind(config.collect_addr).await?;
        let publish_addr = publish_listener.local_addr()?;
        let collect_addr = collect_listener.local_addr()?;

        info!(
            publish = %publish_addr,
            collect = %collect_addr,
            auth = config.auth,
            "pipe server listening"
        );

        let cancel = CancellationToken::new();
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());

        let PipeBackend {
            requests,
            responses,
            operations,
        } = backend;

        tokio::spawn(run_publisher(
            requests,
            Arc::clone(&subscribers),
            cancel.clone(),
        ));
        tokio::spawn(run_operator(operations, cancel.clone()));
        tokio::spawn(accept_subscribers(
            publish_listener,
            Arc::clone(&subscribers),
            config.clone(),
            cancel.clone(),
        ));
        tokio::spawn(accept_collectors(
            collect_listener,
            responses,
            config,
            cancel.clone(),
        ));

        Ok(Self {
            publish_addr,
            collect_addr,
            cancel,
        })
    }

    /// The bound publish address.
    #[must_use]
    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    /// The bound collect address.
    #[must_use]
    pub fn collect_addr(&self) -> SocketAddr {
        self.collect_addr
    }

    /// Stop all broker tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_publisher(
    mut requests: mpsc::Receiver<crate::pipe::Message>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            message = requests.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        let frame = encode_frame(&message);
        for entry in subscribers.iter() {
            if !entry
                .prefixes
                .iter()
                .any(|prefix| message.topic.starts_with(prefix.as_str()))
            {
                continue;
            }
            // Lossy on overflow or a dead connection.
            if entry.frames.try_send(frame.clone()).is_err() {
                debug!(topic = %message.topic, "dropped frame for slow subscriber");
            }
        }
    }
}

async fn run_operator(mut operations: mpsc::Receiver<Operation>, cancel: CancellationToken) {
    loop {
        let operation = tokio::select! {
            () = cancel.cancelled() => return,
            operation = operations.recv() => match operation {
                Some(operation) => operation,
                None => return,
            },
        };

        match operation {
            Operation::AuthAdd(keys) => {
                auth::global()
                    .add_keys(keys.iter().map(|(client, key)| (client.as_str(), key.as_str())));
            }
            Operation::AuthRemove(key) => auth::global().remove_key(&key),
        }
    }
}

async fn accept_subscribers(
    listener: TcpListener,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    config: PipeServerConfig,
    cancel: CancellationToken,
) {
    let next_id = AtomicU64::new(0);
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "error accepting subscriber");
                    continue;
                }
            },
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let subscribers = Arc::clone(&subscribers);
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "subscriber connected");
            serve_subscriber(stream, id, subscribers, config, cancel).await;
            debug!(peer = %peer, "subscriber disconnected");
        });
    }
}

async fn serve_subscriber(
    stream: TcpStream,
    id: u64,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    config: PipeServerConfig,
    cancel: CancellationToken,
) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut source) = framed.split();

    let hello = match read_hello(&mut source).await {
        Some(hello) => hello,
        None => return,
    };
    if config.auth && !auth::global().is_admitted(&hello.key) {
        warn!("rejecting subscriber with unadmitted key");
        return;
    }

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(config.subscriber_queue);
    subscribers.insert(
        id,
        Subscriber {
            prefixes: hello.subscriptions,
            frames: frame_tx,
        },
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(frame.into()).await.is_err() {
                    break;
                }
            }
            update = source.next() => {
                let Some(Ok(bytes)) = update else { break };
                match serde_json::from_slice::<SubscriptionUpdate>(&bytes) {
                    Ok(update) => apply_update(&subscribers, id, update),
                    Err(e) => warn!(error = %e, "malformed subscription update"),
                }
            }
        }
    }

    subscribers.remove(&id);
}

fn apply_update(subscribers: &DashMap<u64, Subscriber>, id: u64, update: SubscriptionUpdate) {
    if let Some(mut subscriber) = subscribers.get_mut(&id) {
        match update.op {
            SubscriptionOp::Subscribe => {
                if !subscriber.prefixes.contains(&update.prefix) {
                    subscriber.prefixes.push(update.prefix);
                }
            }
            SubscriptionOp::Unsubscribe => {
                subscriber.prefixes.retain(|p| p != &update.prefix);
            }
        }
    }
}

async fn accept_collectors(
    listener: TcpListener,
    responses: mpsc::Sender<crate::pipe::Message>,
    config: PipeServerConfig,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "error accepting collector");
                    continue;
                }
            },
        };

        let responses = responses.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "collector connected");
            serve_collector(stream, responses, config, cancel).await;
            debug!(peer = %peer, "collector disconnected");
        });
    }
}

async fn serve_collector(
    stream: TcpStream,
    responses: mpsc::Sender<crate::pipe::Message>,
    config: PipeServerConfig,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let hello = match read_hello(&mut framed).await {
        Some(hello) => hello,
        None => return,
    };

    loop {
        let bytes = tokio::select! {
            () = cancel.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => bytes,
                _ => return,
            },
        };

        // Admission is re-checked per frame so a withdrawn key takes
        // effect on live connections.
        if config.auth && !auth::global().is_admitted(&hello.key) {
            warn!("dropping frame from unadmitted key");
            continue;
        }

        match decode_frame(&bytes) {
            Some(message) => {
                if responses.send(message).await.is_err() {
                    return;
                }
            }
            None => warn!(len = bytes.len(), "unable to parse response frame"),
        }
    }
}

async fn read_hello<S>(source: &mut S) -> Option<Hello>
where
    S: futures::Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin,
{
    let bytes = match source.next().await {
        Some(Ok(bytes)) => bytes,
        _ => return None,
    };
    match serde_json::from_slice(&bytes) {
        Ok(hello) => Some(hello),
        Err(e) => {
            warn!(error = %e, "malformed hello frame");
            None
        }
    }
}

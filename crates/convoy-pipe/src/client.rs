//! Agent-side connector for the TCP broker.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::PipeError;
use crate::framing::{decode_frame, encode_frame};
use crate::pipe::{AgentConn, Subscription};
use crate::server::{Hello, SubscriptionOp, SubscriptionUpdate};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct PipeClientConfig {
    /// The broker's publish address.
    pub publish_addr: SocketAddr,

    /// The broker's collect address.
    pub collect_addr: SocketAddr,

    /// This agent's Z85 public key, presented in the hello frame.
    pub key: String,

    /// Initial subscription prefixes.
    pub subscriptions: Vec<String>,

    /// Inbound queue depth.
    pub queue: usize,
}

/// Connect both sockets and return a transport-agnostic [`AgentConn`].
///
/// Receive and send loops run on their own tasks; socket errors are logged
/// and end the affected loop without touching the other direction.
pub async fn connect(config: PipeClientConfig) -> Result<AgentConn, PipeError> {
    let publish_stream = TcpStream::connect(config.publish_addr).await?;
    let collect_stream = TcpStream::connect(config.collect_addr).await?;

    let mut publish_framed = Framed::new(publish_stream, LengthDelimitedCodec::new());
    let mut collect_framed = Framed::new(collect_stream, LengthDelimitedCodec::new());

    let hello = serde_json::to_vec(&Hello {
        key: config.key.clone(),
        subscriptions: config.subscriptions.clone(),
    })?;
    publish_framed.send(hello.clone().into()).await?;
    collect_framed.send(hello.into()).await?;

    let (incoming_tx, incoming_rx) = mpsc::channel(config.queue);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<crate::pipe::Message>(config.queue);
    let (control_tx, mut control_rx) = mpsc::channel::<Subscription>(config.queue);

    // Publish socket: broker frames in, subscription updates out.
    tokio::spawn(async move {
        let (mut sink, mut source) = publish_framed.split();
        loop {
            tokio::select! {
                frame = source.next() => {
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(bytes) => match decode_frame(&bytes) {
                            Some(message) => {
                                if incoming_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => warn!(len = bytes.len(), "unable to parse request frame"),
                        },
                        Err(e) => {
                            warn!(error = %e, "error receiving request frame");
                        }
                    }
                }
                update = control_rx.recv() => {
                    let Some(update) = update else { break };
                    let (op, prefix) = match update {
                        Subscription::Add(prefix) => (SubscriptionOp::Subscribe, prefix),
                        Subscription::Remove(prefix) => (SubscriptionOp::Unsubscribe, prefix),
                    };
                    let update = SubscriptionUpdate { op, prefix };
                    let Ok(bytes) = serde_json::to_vec(&update) else { continue };
                    if sink.send(bytes.into()).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("publish connection closed");
    });

    // Collect socket: response frames out.
    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let frame = encode_frame(&message);
            if let Err(e) = collect_framed.send(frame.into()).await {
                warn!(error = %e, "error delivering response frame");
                break;
            }
        }
        debug!("collect connection closed");
    });

    Ok(AgentConn::from_parts(incoming_rx, outgoing_tx, control_tx))
}

//! The three-queue pipe and the agent-side connection handle.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;

use convoy_model::Topic;

use crate::error::PipeError;

/// One topic-addressed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message is published on; subscribers filter by prefix.
    pub topic: String,

    /// Opaque payload bytes (JSON for all Convoy envelopes).
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message from raw parts.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// Create a message by serialising `value` as JSON on `topic`.
    pub fn json<T: Serialize>(topic: &Topic, value: &T) -> Result<Self, PipeError> {
        Ok(Self {
            topic: topic.render(),
            payload: serde_json::to_vec(value)?,
        })
    }
}

/// Control-plane key administration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Admit client public keys, mapped from client name to Z85 key.
    AuthAdd(HashMap<String, String>),

    /// Withdraw one client public key.
    AuthRemove(String),
}

/// The manager-core side of the pipe.
#[derive(Debug)]
pub struct Pipe {
    /// Outbound topic-framed requests.
    pub requests: mpsc::Sender<Message>,

    /// Inbound responses from agents. Single consumer: the response demux.
    pub responses: mpsc::Receiver<Message>,

    /// Outbound key administration.
    pub operations: mpsc::Sender<Operation>,
}

/// The transport side of the pipe.
#[derive(Debug)]
pub struct PipeBackend {
    /// Requests to publish.
    pub requests: mpsc::Receiver<Message>,

    /// Responses received from agents.
    pub responses: mpsc::Sender<Message>,

    /// Key administration to apply.
    pub operations: mpsc::Receiver<Operation>,
}

/// Create a connected [`Pipe`]/[`PipeBackend`] pair with bounded queues.
#[must_use]
pub fn pipe(capacity: usize) -> (Pipe, PipeBackend) {
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (response_tx, response_rx) = mpsc::channel(capacity);
    let (operation_tx, operation_rx) = mpsc::channel(capacity);

    (
        Pipe {
            requests: request_tx,
            responses: response_rx,
            operations: operation_tx,
        },
        PipeBackend {
            requests: request_rx,
            responses: response_tx,
            operations: operation_rx,
        },
    )
}

/// A subscription change requested by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Start receiving topics with this prefix.
    Add(String),

    /// Stop receiving topics with this prefix.
    Remove(String),
}

/// The sending half of an agent connection; cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentSender {
    outgoing: mpsc::Sender<Message>,
    control: mpsc::Sender<Subscription>,
}

impl AgentSender {
    /// Publish a response frame towards the manager.
    pub async fn send(&self, message: Message) -> Result<(), PipeError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| PipeError::Closed)
    }

    /// Start receiving topics with the given prefix.
    pub async fn subscribe(&self, prefix: impl Into<String>) -> Result<(), PipeError> {
        self.control
            .send(Subscription::Add(prefix.into()))
            .await
            .map_err(|_| PipeError::Closed)
    }

    /// Stop receiving topics with the given prefix.
    pub async fn unsubscribe(&self, prefix: impl Into<String>) -> Result<(), PipeError> {
        self.control
            .send(Subscription::Remove(prefix.into()))
            .await
            .map_err(|_| PipeError::Closed)
    }
}

/// An agent's connection to the pipe, transport-agnostic.
#[derive(Debug)]
pub struct AgentConn {
    incoming: mpsc::Receiver<Message>,
    sender: AgentSender,
}

impl AgentConn {
    /// Assemble a connection from its channel ends. Used by transports.
    #[must_use]
    pub fn from_parts(
        incoming: mpsc::Receiver<Message>,
        outgoing: mpsc::Sender<Message>,
        control: mpsc::Sender<Subscription>,
    ) -> Self {
        Self {
            incoming,
            sender: AgentSender { outgoing, control },
        }
    }

    /// Receive the next frame addressed to this agent. `None` when the
    /// transport has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    /// A clonable sending half.
    #[must_use]
    pub fn sender(&self) -> AgentSender {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_model::TargetId;

    #[test]
    fn json_message_renders_topic() {
        let topic = Topic::id(TargetId::new("t1")).expect("valid topic");
        let message = Message::json(&topic, &serde_json::json!({"a": 1})).expect("encode");
        assert_eq!(message.topic, "ID-t1");
        assert_eq!(message.payload, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn pipe_pair_is_connected() {
        let (mut pipe, mut backend) = pipe(4);

        pipe.requests
            .send(Message::new("ALL", b"x".to_vec()))
            .await
            .expect("send");
        let got = backend.requests.recv().await.expect("recv");
        assert_eq!(got.topic, "ALL");

        backend
            .responses
            .send(Message::new("RES/LOG", Vec::new()))
            .await
            .expect("send");
        let got = pipe.responses.recv().await.expect("recv");
        assert_eq!(got.topic, "RES/LOG");
    }
}

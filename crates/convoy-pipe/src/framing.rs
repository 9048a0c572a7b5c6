//! Topic-prefixed frame encoding.
//!
//! A frame is `topic ∥ ":" ∥ payload`. The separator is reserved; topic
//! constructors in `convoy-model` refuse names containing it.

use convoy_model::TOPIC_SEPARATOR;

use crate::pipe::Message;

/// Encode a message into wire bytes.
#[must_use]
pub fn encode_frame(message: &Message) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.topic.len() + 1 + message.payload.len());
    frame.extend_from_slice(message.topic.as_bytes());
    frame.push(TOPIC_SEPARATOR as u8);
    frame.extend_from_slice(&message.payload);
    frame
}

/// Decode wire bytes into a message, splitting at the first separator.
/// Returns `None` for frames with no separator or a non-UTF-8 topic.
#[must_use]
pub fn decode_frame(frame: &[u8]) -> Option<Message> {
    let split = frame.iter().position(|b| *b == TOPIC_SEPARATOR as u8)?;
    let topic = std::str::from_utf8(&frame[..split]).ok()?;
    if topic.is_empty() {
        return None;
    }
    Some(Message::new(topic, frame[split + 1..].to_vec()))
}

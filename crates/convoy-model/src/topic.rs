//! Topic addressing for the publish/subscribe pipe.
//!
//! Every frame on the wire is `topic ∥ ":" ∥ payload`. Subscribers filter by
//! topic prefix. Reserved names:
//!
//! - `ID-<uuid>` — unicast to one agent
//! - `TAG-<label>` — multicast to agents carrying the tag
//! - `ALL` — broadcast
//! - `<task-uuid>` — a task body; agents subscribe transiently after
//!   accepting the announcement
//! - `RES/ADV`, `RES/PKG`, `RES/LOG` — agent-to-manager responses

use std::fmt;

use crate::error::ModelError;
use crate::types::{OrderId, TargetId};

/// Reserved separator between topic and payload. Topic names must not
/// contain it.
pub const TOPIC_SEPARATOR: char = ':';

/// Broadcast topic.
pub const TOPIC_ALL: &str = "ALL";

/// Unicast topic prefix.
pub const PREFIX_ID: &str = "ID-";

/// Tag multicast topic prefix.
pub const PREFIX_TAG: &str = "TAG-";

/// Advertisement response topic.
pub const TOPIC_ADVERTISEMENT: &str = "RES/ADV";

/// Assembler package response topic.
pub const TOPIC_PACKAGE: &str = "RES/PKG";

/// Ordinary log response topic.
pub const TOPIC_LOG: &str = "RES/LOG";

/// A validated topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Broadcast to every agent.
    All,

    /// Unicast to one agent.
    Id(TargetId),

    /// Multicast to agents carrying a tag.
    Tag(String),

    /// A task body, addressed by order ID.
    Task(OrderId),

    /// Agent advertisement responses.
    Advertisement,

    /// Assembler package responses.
    Package,

    /// Ordinary log responses.
    Log,
}

impl Topic {
    /// A unicast topic for `target`, rejecting IDs that would corrupt the
    /// framing.
    pub fn id(target: TargetId) -> Result<Self, ModelError> {
        ensure_clean(target.as_str())?;
        Ok(Self::Id(target))
    }

    /// A tag multicast topic, rejecting labels that would corrupt the
    /// framing.
    pub fn tag(label: impl Into<String>) -> Result<Self, ModelError> {
        let label = label.into();
        ensure_clean(&label)?;
        Ok(Self::Tag(label))
    }

    /// The topic string as it appears on the wire.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::All => TOPIC_ALL.to_owned(),
            Self::Id(id) => format!("{PREFIX_ID}{id}"),
            Self::Tag(label) => format!("{PREFIX_TAG}{label}"),
            Self::Task(id) => id.to_string(),
            Self::Advertisement => TOPIC_ADVERTISEMENT.to_owned(),
            Self::Package => TOPIC_PACKAGE.to_owned(),
            Self::Log => TOPIC_LOG.to_owned(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn ensure_clean(name: &str) -> Result<(), ModelError> {
    if name.is_empty() || name.contains(TOPIC_SEPARATOR) {
        return Err(ModelError::InvalidTopic(name.to_owned()));
    }
    Ok(())
}

//! Durable target records.

use serde::{Deserialize, Serialize};

use crate::types::{TargetId, UnixTime};

/// A known agent, created on first advertisement and patched on every
/// subsequent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// The agent's identity.
    pub id: TargetId,

    /// Labels the agent carries, used for `TAG-` addressing.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Last time an advertisement was seen.
    pub updated_at: UnixTime,

    /// High-water mark for log backfill: the time of the newest log the
    /// manager has requested from this target. Non-decreasing.
    #[serde(default)]
    pub log_request_at: UnixTime,
}

impl Target {
    /// A freshly advertised target with a zero backfill watermark.
    #[must_use]
    pub fn new(id: TargetId, tags: Vec<String>) -> Self {
        Self {
            id,
            tags,
            updated_at: UnixTime::now(),
            log_request_at: UnixTime::ZERO,
        }
    }

    /// True when the target carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

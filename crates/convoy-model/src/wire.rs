//! Wire envelopes exchanged over the pipe, all JSON.

use serde::{Deserialize, Serialize};

use crate::log::LogRecord;
use crate::task::Announcement;
use crate::types::{OrderId, TargetId, UnixTime};

/// Base64 transport encoding for embedded binary payloads.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Manager-to-agent request envelope published on receiver topics.
///
/// Exactly one field is set per message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWrapper {
    /// A task announcement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<Announcement>,

    /// A log backfill request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_request: Option<LogRequest>,

    /// Acknowledgement that the assembler's package for this order was
    /// received, so the assembler may discard its task directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_ack: Option<OrderId>,
}

impl RequestWrapper {
    /// Wrap an announcement.
    #[must_use]
    pub fn announcement(announcement: Announcement) -> Self {
        Self {
            announcement: Some(announcement),
            ..Self::default()
        }
    }

    /// Wrap a log backfill request.
    #[must_use]
    pub fn log_request(request: LogRequest) -> Self {
        Self {
            log_request: Some(request),
            ..Self::default()
        }
    }

    /// Wrap a package acknowledgement.
    #[must_use]
    pub fn package_ack(order: OrderId) -> Self {
        Self {
            package_ack: Some(order),
            ..Self::default()
        }
    }
}

/// Ask a target for all logs newer than a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// Only logs strictly newer than this are wanted.
    pub if_modified_since: UnixTime,
}

/// Agent-to-manager log report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The reporting agent.
    pub target_id: TargetId,

    /// Log records, in emission order.
    pub logs: Vec<LogRecord>,

    /// True when this response answers a [`LogRequest`].
    #[serde(default)]
    pub on_request: bool,
}

/// Agent-to-manager advertisement of identity and tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAdvertisement {
    /// The advertising agent.
    pub id: TargetId,

    /// Labels the agent carries.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Assembler-to-manager build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// The order the build belongs to.
    pub task: OrderId,

    /// The assembler host that produced the package.
    pub assembler: TargetId,

    /// Compressed build output. Base64 in transit.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

//! Durable order shapes owned by the manager.

use serde::{Deserialize, Serialize};

use crate::task::DeployCommands;
use crate::types::{Header, TargetId};

/// Selector for the deploy leg's receivers, by explicit ID and/or tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelector {
    /// Explicit target IDs.
    #[serde(default)]
    pub ids: Vec<TargetId>,

    /// Tag labels; a target carrying any of them matches.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TargetSelector {
    /// True when neither IDs nor tags are given.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.tags.is_empty()
    }
}

/// The resolved receiver set for an order's deploy leg.
///
/// `list` is the concrete set of target IDs that matched either selector;
/// it is non-empty at send time or intake rejects the order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Requested IDs that resolved to known targets.
    #[serde(default)]
    pub ids: Vec<TargetId>,

    /// Requested tags that matched at least one target.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Every target ID that matched either selector.
    #[serde(default)]
    pub list: Vec<TargetId>,
}

impl Match {
    /// A match pinned to a single host (the assembler path).
    #[must_use]
    pub fn single(host: TargetId) -> Self {
        Self {
            ids: vec![host.clone()],
            tags: Vec::new(),
            list: vec![host],
        }
    }
}

/// The build leg of an order: run `commands` on `host`, collect the output
/// as a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// The designated assembler host.
    pub host: TargetId,

    /// Build-stage commands, run sequentially.
    #[serde(default)]
    pub commands: Vec<String>,
}

/// The deploy leg of an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    /// Receiver selector.
    #[serde(default)]
    pub target: TargetSelector,

    /// Install- and run-stage command lists.
    #[serde(flatten)]
    pub commands: DeployCommands,

    /// Resolved receivers, populated at intake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<Match>,
}

/// A user-submitted deployment request.
///
/// At least one of `build`/`deploy` is set. When both are present the build
/// leg runs first; the manager clears `build` once the assembler returns a
/// package and resubmits the deploy leg. Orders are never deleted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Header; `header.id` is the order ID.
    pub header: Header,

    /// Build leg, cleared after the assembler round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Deploy leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
}

impl Order {
    /// True when the order still has a leg to dispatch.
    #[must_use]
    pub fn has_leg(&self) -> bool {
        self.build.is_some() || self.deploy.is_some()
    }
}

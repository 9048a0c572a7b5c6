//! Log records emitted by agents and the manager.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{OrderId, TargetId, UnixTime};

/// Sentinel output marking the terminal log record for a (task, target, stage)
/// triple. The `error` flag on the terminal record tells whether the stage
/// failed.
pub const STAGE_END: &str = "END";

/// Sentinel command for records generated by the manager rather than by a
/// child process on a target.
pub const COMMAND_BY_MANAGER: &str = "$manager";

/// Lifecycle phase of a task on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Delivery of the task message and artifacts.
    Transfer,

    /// Artifact staging and command execution on the target.
    Install,

    /// Long-running execution after installation.
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Install => write!(f, "install"),
            Self::Run => write!(f, "run"),
        }
    }
}

/// One line of task output, durable and append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The order the output belongs to.
    pub task: OrderId,

    /// The target that produced (or was addressed by) the output.
    pub target: TargetId,

    /// Lifecycle stage the output belongs to.
    pub stage: Stage,

    /// The command that produced the output, or [`COMMAND_BY_MANAGER`].
    pub command: String,

    /// One line of output, or [`STAGE_END`] on the terminal record.
    pub output: String,

    /// Whether this line reports a failure.
    #[serde(default)]
    pub error: bool,

    /// When the line was produced.
    pub time: UnixTime,

    /// Whether the order ran with verbose logging.
    #[serde(default)]
    pub debug: bool,
}

impl LogRecord {
    /// True if this is the terminal record of its stage.
    #[must_use]
    pub fn is_stage_end(&self) -> bool {
        self.output == STAGE_END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(output: &str) -> LogRecord {
        LogRecord {
            task: OrderId::new("t1"),
            target: TargetId::new("a1"),
            stage: Stage::Install,
            command: "echo hi".to_owned(),
            output: output.to_owned(),
            error: false,
            time: UnixTime::from_secs(100),
            debug: false,
        }
    }

    #[test]
    fn stage_end_detection() {
        assert!(record(STAGE_END).is_stage_end());
        assert!(!record("hi").is_stage_end());
    }

    #[test]
    fn stage_serialises_lowercase() {
        let json = serde_json::to_string(&Stage::Transfer).expect("serialise");
        assert_eq!(json, "\"transfer\"");
    }
}

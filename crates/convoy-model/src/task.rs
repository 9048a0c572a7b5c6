//! Task and announcement wire objects.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Header;
use crate::wire::base64_bytes;

/// Which leg of an order a task (or its announcement) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Build on the designated assembler host.
    Build,

    /// Deploy to the matched targets.
    Deploy,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Deploy => write!(f, "deploy"),
        }
    }
}

/// Preamble published before a task so receivers can accept or decline
/// based on artifact size before the body arrives.
///
/// An agent that cannot accept `size` drops the announcement silently; one
/// that can must subscribe to the task topic and await the [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Common task header.
    pub header: Header,

    /// Which leg the forthcoming task carries.
    #[serde(rename = "type")]
    pub task_type: TaskType,

    /// Artifact byte count of the forthcoming task.
    pub size: u64,
}

/// Deploy-leg command lists, split by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployCommands {
    /// Commands run during the install stage, sequentially.
    #[serde(default)]
    pub install: Vec<String>,

    /// Commands run during the run stage, after a successful install.
    #[serde(default)]
    pub run: Vec<String>,
}

/// The wire message carrying one leg of an order to agents.
///
/// Exactly one of `build`/`deploy` is set. `header.id` equals the order ID,
/// which is also the topic the task body is published on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Common task header; `id` equals the order ID.
    pub header: Header,

    /// Build-stage commands, when this is the build leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Vec<String>>,

    /// Deploy-stage commands, when this is the deploy leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployCommands>,

    /// Compressed source tarball, possibly empty. Base64 in transit.
    #[serde(with = "base64_bytes")]
    pub artifacts: Vec<u8>,
}

impl Task {
    /// Which leg this task carries.
    #[must_use]
    pub fn task_type(&self) -> TaskType {
        if self.build.is_some() {
            TaskType::Build
        } else {
            TaskType::Deploy
        }
    }

    /// The announcement preceding this task on the receiver topics.
    #[must_use]
    pub fn announcement(&self) -> Announcement {
        Announcement {
            header: self.header.clone(),
            task_type: self.task_type(),
            size: self.artifacts.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderId;

    fn deploy_task() -> Task {
        Task {
            header: Header::new(OrderId::new("o1"), false),
            build: None,
            deploy: Some(DeployCommands {
                install: vec!["echo hi".to_owned()],
                run: Vec::new(),
            }),
            artifacts: vec![1, 2, 3],
        }
    }

    #[test]
    fn task_type_follows_leg() {
        let task = deploy_task();
        assert_eq!(task.task_type(), TaskType::Deploy);

        let build = Task {
            build: Some(vec!["make".to_owned()]),
            deploy: None,
            ..deploy_task()
        };
        assert_eq!(build.task_type(), TaskType::Build);
    }

    #[test]
    fn announcement_carries_artifact_size() {
        let ann = deploy_task().announcement();
        assert_eq!(ann.size, 3);
        assert_eq!(ann.task_type, TaskType::Deploy);
    }

    #[test]
    fn artifacts_embed_as_base64() {
        let json = serde_json::to_string(&deploy_task()).expect("serialise");
        assert!(json.contains("\"artifacts\":\"AQID\""));

        let back: Task = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back.artifacts, vec![1, 2, 3]);
    }
}

//! Shared domain and wire model for Convoy inter-component communication.
//!
//! This crate carries everything the manager and agents agree on:
//!
//! - Identifier newtypes and the common task [`Header`]
//! - Durable shapes ([`Order`], [`Target`], [`LogRecord`])
//! - Wire envelopes ([`Task`], [`Announcement`], [`Response`], [`Package`])
//! - Topic addressing (`ID-<uuid>`, `TAG-<label>`, `ALL`) and framing
//!   constants
//! - The tar+gzip archive codec used for source transfer and package return
//!
//! All wire messages are JSON; embedded binary payloads (task artifacts,
//! package payloads) are base64-encoded in transit.

pub mod archive;
mod error;
mod log;
mod order;
mod target;
mod task;
pub mod topic;
mod types;
mod wire;

pub use archive::{compress_files, decompress_files};
pub use error::{ArchiveError, ModelError};
pub use log::{LogRecord, Stage, COMMAND_BY_MANAGER, STAGE_END};
pub use order::{Build, Deploy, Match, Order, TargetSelector};
pub use target::Target;
pub use task::{Announcement, DeployCommands, Task, TaskType};
pub use topic::{Topic, TOPIC_ALL, TOPIC_SEPARATOR};
pub use types::{Header, OrderId, TargetId, UnixTime};
pub use wire::{base64_bytes, LogRequest, Package, RequestWrapper, Response, TargetAdvertisement};

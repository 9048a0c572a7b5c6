//! Order lifecycle and orchestration core for Convoy.
//!
//! The manager accepts deployment orders, stages their sources, composes
//! wire tasks, and drives the announce/send/confirm loop until storage
//! confirms delivery to every matched target. Build-then-deploy orders
//! route through a designated assembler whose returned package is unpacked
//! and redeployed.
//!
//! ```text
//! ┌──────────┐    ┌─────────────┐    ┌──────────────────┐
//! │  intake  │───▶│   compose   │───▶│  send / confirm  │──▶ pipe
//! └──────────┘    └─────────────┘    └──────────────────┘
//!       │                ▲
//!       ▼                │ package
//! ┌──────────┐    ┌─────────────┐
//! │ storage  │◀───│ demux loop  │◀── pipe responses
//! └──────────┘    └─────────────┘
//! ```

pub mod config;
mod error;
pub mod events;
mod manager;
pub mod source;
pub mod storage;

pub use config::ManagerConfig;
pub use error::{ManagerError, ManagerResult};
pub use events::{Event, EventBus, EVENT_LOGS, EVENT_TARGET_ADDED, EVENT_TARGET_UPDATED};
pub use manager::{spawn_guarded, Manager, OrderRequest};
pub use source::{Source, SourceError, SOURCE_DIR};
pub use storage::{
    LogFilter, LogSortField, MatchedTargets, MemoryStorage, Storage, StorageError, StorageResult,
};

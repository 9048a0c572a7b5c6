//! Installer agent for the Convoy deployment orchestrator.
//!
//! The agent subscribes to its receiver topics (`ALL`, `ID-<id>`, one
//! `TAG-` prefix per tag), evaluates task announcements against a memory
//! capacity heuristic, stages artifacts under `tasks/<id>/`, executes the
//! task's command list sequentially and streams every output line back to
//! the manager as log records.

pub mod advertiser;
pub mod config;
mod error;
pub mod executor;
pub mod installer;
pub mod responder;

pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::Executor;
pub use installer::{free_capacity, Installer, InstallerOptions, TaskPhase};
pub use responder::{spawn as spawn_responder, ResponderHandle};

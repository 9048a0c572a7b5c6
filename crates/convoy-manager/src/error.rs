//! Error types for the manager core.

use convoy_model::{ArchiveError, ModelError, TargetId};
use convoy_pipe::PipeError;

use crate::source::SourceError;
use crate::storage::StorageError;

/// Result type alias using [`ManagerError`].
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors surfaced by the manager core. Intake variants are returned to
/// the caller synchronously; the rest surface as transfer-stage logs.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The build leg names a host no advertisement has been seen from.
    #[error("unknown build host: {0}")]
    UnknownBuildHost(TargetId),

    /// The deploy selector resolved to nothing.
    #[error("deployment matches no targets")]
    NoMatchingTargets,

    /// The order carries neither a build nor a deploy leg.
    #[error("order has neither build nor deploy leg")]
    EmptyOrder,

    /// A log request named an unknown target.
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    /// Source staging failed.
    #[error("source staging failed: {0}")]
    Source(#[from] SourceError),

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Archive codec failure.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Model-level failure (topic validation).
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Pipe failure.
    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),

    /// Wire envelope failure.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// The transport shut down under us.
    #[error("pipe closed")]
    PipeClosed,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

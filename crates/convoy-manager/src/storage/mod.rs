//! Durable storage for orders, targets and logs.
//!
//! Storage is the single source of truth for durable objects; all mutation
//! goes through this interface. The in-memory implementation backs tests
//! and single-node deployments.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;

use convoy_model::{LogRecord, Order, OrderId, Stage, Target, TargetId};

/// Result type alias using [`StorageError`].
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Invariant violation inside the backend.
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Sort key for log queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogSortField {
    /// Emission time.
    #[default]
    Time,

    /// Reporting target.
    Target,

    /// Owning task.
    Task,
}

/// Filter criteria for log queries.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Restrict to one target.
    pub target: Option<TargetId>,

    /// Restrict to one task.
    pub task: Option<OrderId>,

    /// Restrict to one stage.
    pub stage: Option<Stage>,

    /// Restrict to one command.
    pub command: Option<String>,

    /// Sort key.
    pub sort: LogSortField,

    /// Ascending sort order.
    pub ascending: bool,

    /// Pagination offset.
    pub offset: usize,

    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl LogFilter {
    /// Create an empty filter sorted by time, descending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one target.
    #[must_use]
    pub fn with_target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    /// Restrict to one task.
    #[must_use]
    pub fn with_task(mut self, task: OrderId) -> Self {
        self.task = Some(task);
        self
    }

    /// Restrict to one stage.
    #[must_use]
    pub const fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Restrict to one command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the sort key and direction.
    #[must_use]
    pub const fn sorted(mut self, sort: LogSortField, ascending: bool) -> Self {
        self.sort = sort;
        self.ascending = ascending;
        self
    }

    /// Set the pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the maximum number of results.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of a target match query.
#[derive(Debug, Clone, Default)]
pub struct MatchedTargets {
    /// Every target that matched either selector.
    pub receivers: Vec<Target>,

    /// Requested IDs that resolved to known targets.
    pub hit_ids: Vec<TargetId>,

    /// Requested tags carried by at least one target.
    pub hit_tags: Vec<String>,
}

/// Backend for orders, targets and logs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace an order. Orders are replaced exactly once, when
    /// the assembler round-trip clears the build leg.
    async fn add_order(&self, order: &Order) -> StorageResult<()>;

    /// Get an order by ID.
    async fn get_order(&self, id: &OrderId) -> StorageResult<Option<Order>>;

    /// List orders newest-first with pagination. Returns the page and the
    /// total count.
    async fn get_orders(&self, offset: usize, limit: usize) -> StorageResult<(Vec<Order>, usize)>;

    /// Insert a target on first advertisement.
    async fn add_target(&self, target: &Target) -> StorageResult<()>;

    /// Replace a target's record. Returns false when the target is unknown.
    async fn patch_target(&self, id: &TargetId, target: &Target) -> StorageResult<bool>;

    /// Get a target by ID.
    async fn get_target(&self, id: &TargetId) -> StorageResult<Option<Target>>;

    /// List targets carrying any of `tags` (all targets when empty), with
    /// pagination. Returns the page and the total count.
    async fn get_targets(
        &self,
        tags: &[String],
        offset: usize,
        limit: usize,
    ) -> StorageResult<(Vec<Target>, usize)>;

    /// Resolve deploy receivers: every target matching either an explicit
    /// ID or any tag.
    async fn match_targets(
        &self,
        ids: &[TargetId],
        tags: &[String],
    ) -> StorageResult<MatchedTargets>;

    /// Append log records.
    async fn add_logs(&self, logs: &[LogRecord]) -> StorageResult<()>;

    /// Query logs with filtering, sorting and pagination. Returns the page
    /// and the total matching count.
    async fn get_logs(&self, filter: &LogFilter) -> StorageResult<(Vec<LogRecord>, usize)>;

    /// Full-text search over log output, oldest first. Returns matches and
    /// the total count.
    async fn search_logs(&self, query: &str) -> StorageResult<(Vec<LogRecord>, usize)>;

    /// True iff any log exists for the (target, task) pair. Monotonic:
    /// once true, always true.
    async fn delivered_task(&self, target: &TargetId, task: &OrderId) -> StorageResult<bool>;
}

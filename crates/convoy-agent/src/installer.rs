//! The per-task installer state machine.
//!
//! ```text
//! IDLE ──announce──▶ EVALUATING ──fits?──▶ AWAITING_TASK ──task──▶ STORING
//!                       │ no                                         │
//!                       ▼                                            ▼
//!                      IDLE                                     INSTALLING ──ok──▶ DONE
//!                                                                    │ fail
//!                                                                    ▼
//!                                                                  FAILED
//! ```
//!
//! An announcement is accepted only when the advertised artifact size fits
//! the capacity heuristic; rejection is silent. Accepted tasks are staged
//! under `tasks/<id>/`, their commands run sequentially, and exactly one
//! terminal stage-end record is emitted. Completed sibling task
//! directories are evicted so only the current task persists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convoy_model::{
    compress_files, decompress_files, Announcement, LogRecord, OrderId, Package, RequestWrapper,
    Stage, TargetId, Task, Topic, UnixTime, STAGE_END,
};
use convoy_pipe::{AgentConn, AgentSender, Message};

use crate::error::AgentError;
use crate::executor::Executor;
use crate::responder::ResponderHandle;

/// Directory name the staged source lives in, below the task directory.
const SOURCE_DIR: &str = "src";

/// Per-task lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPhase {
    /// Announcement accepted; subscribed to the task topic.
    AwaitingTask,

    /// Unpacking artifacts.
    Storing,

    /// Running commands.
    Installing,

    /// All stages succeeded.
    Done,

    /// A stage failed.
    Failed,
}

impl TaskPhase {
    /// True when the task has finished, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Installer settings.
#[derive(Debug, Clone)]
pub struct InstallerOptions {
    /// This agent's identity.
    pub target_id: TargetId,

    /// Root below which per-task directories live (`tasks/<id>/`).
    pub work_dir: PathBuf,

    /// Grace period for children after a stop signal.
    pub stop_grace: Duration,
}

/// The installer: evaluates announcements, stages artifacts, executes
/// command lists and streams logs through the responder.
pub struct Installer {
    options: InstallerOptions,
    sender: AgentSender,
    responder: ResponderHandle,
    cancel: CancellationToken,
    phases: HashMap<OrderId, TaskPhase>,
}

impl Installer {
    /// Create an installer.
    #[must_use]
    pub fn new(
        options: InstallerOptions,
        sender: AgentSender,
        responder: ResponderHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            sender,
            responder,
            cancel,
            phases: HashMap::new(),
        }
    }

    /// The recorded phase for a task, if any message for it was accepted.
    #[must_use]
    pub fn phase(&self, task: &OrderId) -> Option<&TaskPhase> {
        self.phases.get(task)
    }

    /// Drive the installer from the connection until shutdown.
    pub async fn run(mut self, mut conn: AgentConn) {
        info!(target_id = %self.options.target_id, "installer running");
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("installer shutting down");
                    self.responder.flush().await;
                    return;
                }
                message = conn.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!("pipe closed, installer stopping");
                        return;
                    }
                },
            };
            self.handle_message(message).await;
        }
    }

    /// Dispatch one frame. Task bodies arrive on their own task topic;
    /// everything else is a request wrapper on a receiver topic.
    pub async fn handle_message(&mut self, message: Message) {
        if self.phases.contains_key(&OrderId::new(message.topic.clone())) {
            match serde_json::from_slice::<Task>(&message.payload) {
                Ok(task) => self.handle_task(task).await,
                Err(e) => warn!(topic = %message.topic, error = %e, "malformed task, dropping"),
            }
            return;
        }

        match serde_json::from_slice::<RequestWrapper>(&message.payload) {
            Ok(wrapper) => self.handle_request(wrapper).await,
            Err(e) => warn!(topic = %message.topic, error = %e, "malformed request, dropping"),
        }
    }

    async fn handle_request(&mut self, wrapper: RequestWrapper) {
        if let Some(announcement) = wrapper.announcement {
            self.evaluate(announcement).await;
        }
        if let Some(request) = wrapper.log_request {
            self.responder.backfill(request.if_modified_since).await;
        }
        if let Some(order) = wrapper.package_ack {
            debug!(task = %order, "package acknowledged, removing task directory");
            let dir = self.task_dir(&order);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!(task = %order, error = %e, "task directory already gone");
            }
        }
    }

    /// EVALUATING: accept iff the artifacts fit free capacity. Rejection
    /// is silent; acceptance subscribes to the task topic.
    async fn evaluate(&mut self, announcement: Announcement) {
        let id = announcement.header.id.clone();

        if let Some(phase) = self.phases.get(&id) {
            if phase.is_terminal() {
                // Redelivery of a finished task: repair the manager's view
                // instead of re-running anything.
                debug!(task = %id, "announcement for completed task, replaying logs");
                self.responder.replay(id).await;
                return;
            }
            debug!(task = %id, phase = ?phase, "announcement for in-flight task ignored");
            return;
        }

        if announcement.size > free_capacity() {
            debug!(
                task = %id,
                size = announcement.size,
                "artifacts exceed capacity, declining silently"
            );
            return;
        }

        if self
            .sender
            .subscribe(Topic::Task(id.clone()).render())
            .await
            .is_err()
        {
            warn!(task = %id, "unable to subscribe to task topic");
            return;
        }

        info!(task = %id, kind = %announcement.task_type, "announcement accepted");
        self.phases.insert(id, TaskPhase::AwaitingTask);
    }

    async fn handle_task(&mut self, task: Task) {
        let id = task.header.id.clone();
        let task_dir = self.task_dir(&id);

        // A replayed body for a task that already ran is never re-executed;
        // its logs are replayed so the manager's delivered-probe converges.
        if self
            .phases
            .get(&id)
            .is_some_and(TaskPhase::is_terminal)
        {
            self.responder.replay(id).await;
            return;
        }

        // A task directory left by an earlier run means the task was
        // installed before this process started. Repair the manager's
        // view without re-running anything.
        if task_dir.exists() {
            debug!(task = %id, "task directory already present, not re-running");
            self.responder
                .log(self.record(
                    &id,
                    Stage::Install,
                    String::new(),
                    "task already installed".to_owned(),
                    false,
                    task.header.debug,
                ))
                .await;
            self.responder
                .log(self.record(
                    &id,
                    Stage::Install,
                    String::new(),
                    STAGE_END.to_owned(),
                    false,
                    task.header.debug,
                ))
                .await;
            self.phases.insert(id, TaskPhase::Done);
            return;
        }

        let is_build = task.build.is_some();

        self.phases.insert(id.clone(), TaskPhase::Storing);
        if let Err(e) = self.store(&task).await {
            warn!(task = %id, error = %e, "artifact staging failed");
            self.log_fatal(&id, task.header.debug, &e.to_string()).await;
            self.phases.insert(id.clone(), TaskPhase::Failed);
            self.clean(&id).await;
            return;
        }

        self.phases.insert(id.clone(), TaskPhase::Installing);
        let commands = match (&task.build, &task.deploy) {
            (Some(build), _) => build.clone(),
            (None, Some(deploy)) => deploy.install.clone(),
            (None, None) => Vec::new(),
        };
        let installed = self
            .run_stage(&id, Stage::Install, &commands, task.header.debug, &task_dir)
            .await;

        let mut succeeded = installed;
        if installed && !is_build {
            if let Some(deploy) = &task.deploy {
                if !deploy.run.is_empty() {
                    succeeded = self
                        .run_stage(&id, Stage::Run, &deploy.run, task.header.debug, &task_dir)
                        .await;
                }
            }
        }

        if installed && is_build {
            self.return_package(&id).await;
        }

        let phase = if succeeded {
            TaskPhase::Done
        } else {
            TaskPhase::Failed
        };
        info!(task = %id, phase = ?phase, "task finished");
        self.phases.insert(id.clone(), phase);
        self.clean(&id).await;
    }

    /// STORING: create the source directory for empty artifacts, unpack
    /// the tarball otherwise.
    async fn store(&self, task: &Task) -> Result<(), AgentError> {
        let id = &task.header.id;
        let task_dir = self.task_dir(id);
        debug!(task = %id, dir = %task_dir.display(), "task work directory");

        if task.artifacts.is_empty() {
            debug!(task = %id, "nothing to store");
            tokio::fs::create_dir_all(task_dir.join(SOURCE_DIR))
                .await
                .map_err(|e| AgentError::Staging(format!("error creating source directory: {e}")))?;
            return Ok(());
        }

        tokio::fs::create_dir_all(&task_dir)
            .await
            .map_err(|e| AgentError::Staging(format!("error creating task directory: {e}")))?;

        info!(task = %id, bytes = task.artifacts.len(), "deploying artifacts");
        decompress_files(task.artifacts.clone(), &task_dir)
            .await
            .map_err(|e| AgentError::Staging(format!("error reading archive: {e}")))?;

        self.responder
            .log(self.record(
                id,
                Stage::Install,
                String::new(),
                format!("decompressed archive of {} bytes", task.artifacts.len()),
                false,
                task.header.debug,
            ))
            .await;
        Ok(())
    }

    /// INSTALLING: run the stage's commands sequentially, stopping on the
    /// first failure, then emit the terminal record.
    async fn run_stage(
        &self,
        id: &OrderId,
        stage: Stage,
        commands: &[String],
        debug: bool,
        task_dir: &std::path::Path,
    ) -> bool {
        if commands.is_empty() {
            debug!(task = %id, stage = %stage, "nothing to execute");
            self.responder
                .log(self.record(id, stage, String::new(), STAGE_END.to_owned(), false, debug))
                .await;
            return true;
        }

        let executor = Executor::new(
            id.clone(),
            self.options.target_id.clone(),
            stage,
            debug,
            self.responder.log_sink(),
            self.cancel.clone(),
            self.options.stop_grace,
        );

        for command in commands {
            if !executor.execute(command, task_dir).await {
                self.responder
                    .log(self.record(
                        id,
                        stage,
                        String::new(),
                        "ended with errors".to_owned(),
                        true,
                        debug,
                    ))
                    .await;
                self.responder
                    .log(self.record(id, stage, String::new(), STAGE_END.to_owned(), true, debug))
                    .await;
                return false;
            }
        }

        self.responder
            .log(self.record(id, stage, String::new(), STAGE_END.to_owned(), false, debug))
            .await;
        true
    }

    /// Assembler path: pack the built source tree and return it.
    async fn return_package(&self, id: &OrderId) {
        let root = self.task_dir(id).join(SOURCE_DIR);
        let payload = match compress_files(&root).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task = %id, error = %e, "unable to pack build output");
                return;
            }
        };

        let package = Package {
            task: id.clone(),
            assembler: self.options.target_id.clone(),
            payload,
        };
        match Message::json(&Topic::Package, &package) {
            Ok(message) => {
                info!(task = %id, "returning package");
                if self.sender.send(message).await.is_err() {
                    warn!(task = %id, "pipe closed, package lost");
                }
            }
            Err(e) => warn!(task = %id, error = %e, "unable to encode package"),
        }
    }

    /// Emit a fatal line plus the terminal record.
    async fn log_fatal(&self, id: &OrderId, debug: bool, output: &str) {
        self.responder
            .log(self.record(id, Stage::Install, String::new(), output.to_owned(), true, debug))
            .await;
        self.responder
            .log(self.record(
                id,
                Stage::Install,
                String::new(),
                STAGE_END.to_owned(),
                true,
                debug,
            ))
            .await;
    }

    /// Evict every task directory except the current one.
    async fn clean(&self, keep: &OrderId) {
        let tasks_dir = self.options.work_dir.join("tasks");
        let mut entries = match tokio::fs::read_dir(&tasks_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy() == keep.as_str() {
                continue;
            }
            let path = entry.path();
            debug!(path = %path.display(), "removing old task directory");
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "error removing old task directory");
            }
        }
    }

    fn record(
        &self,
        id: &OrderId,
        stage: Stage,
        command: String,
        output: String,
        error: bool,
        debug: bool,
    ) -> LogRecord {
        LogRecord {
            task: id.clone(),
            target: self.options.target_id.clone(),
            stage,
            command,
            output,
            error,
            time: UnixTime::now(),
            debug,
        }
    }

    fn task_dir(&self, id: &OrderId) -> PathBuf {
        self.options.work_dir.join("tasks").join(id.as_str())
    }
}

/// The announcement acceptance threshold: half of total physical memory.
/// Conservative, and monotonic in memory pressure.
#[must_use]
pub fn free_capacity() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory() / 2
}

//! Core order orchestration: intake, compose, the announce/send/confirm
//! loop, and the response demux.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use convoy_model::topic::{TOPIC_ADVERTISEMENT, TOPIC_PACKAGE};
use convoy_model::{
    compress_files, decompress_files, Build, Deploy, Header, LogRecord, Match, Order, OrderId,
    Package, RequestWrapper, Response, Stage, Target, TargetAdvertisement, TargetId, Task, Topic,
    UnixTime, COMMAND_BY_MANAGER, STAGE_END,
};
use convoy_pipe::{Message, Operation, Pipe};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::events::{EventBus, EVENT_LOGS, EVENT_TARGET_ADDED, EVENT_TARGET_UPDATED};
use crate::source::{Source, SOURCE_DIR};
use crate::storage::Storage;

/// A user-submitted deployment request, before intake assigns identity.
#[derive(Debug, Clone, Default)]
pub struct OrderRequest {
    /// Where the order's files come from; staged once at intake.
    pub source: Option<Source>,

    /// Build leg.
    pub build: Option<Build>,

    /// Deploy leg.
    pub deploy: Option<Deploy>,

    /// Verbose logging for this order.
    pub debug: bool,
}

/// Orchestrates the order lifecycle.
pub struct Manager {
    storage: Arc<dyn Storage>,
    requests: mpsc::Sender<Message>,
    operations: mpsc::Sender<Operation>,
    events: EventBus,
    config: ManagerConfig,
}

impl Manager {
    /// Create a manager around its collaborators. Returns the manager and
    /// the response stream to feed [`Manager::manage_responses`].
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        pipe: Pipe,
        events: EventBus,
        config: ManagerConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let Pipe {
            requests,
            responses,
            operations,
        } = pipe;

        (
            Arc::new(Self {
                storage,
                requests,
                operations,
                events,
                config,
            }),
            responses,
        )
    }

    /// The event bus, for subscribers.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Admit agent public keys on the transport, mapped client name → Z85
    /// key.
    pub async fn admit_keys(
        &self,
        keys: std::collections::HashMap<String, String>,
    ) -> ManagerResult<()> {
        self.operations
            .send(Operation::AuthAdd(keys))
            .await
            .map_err(|_| ManagerError::PipeClosed)
    }

    /// Withdraw one agent public key from the transport.
    pub async fn remove_key(&self, key: impl Into<String>) -> ManagerResult<()> {
        self.operations
            .send(Operation::AuthRemove(key.into()))
            .await
            .map_err(|_| ManagerError::PipeClosed)
    }

    /// Order intake: assign identity, validate legs, resolve the deploy
    /// match, stage the source, persist, and start the compose task.
    ///
    /// Returns once the order is durable; composition runs asynchronously.
    pub async fn add_order(self: &Arc<Self>, request: OrderRequest) -> ManagerResult<Order> {
        let OrderRequest {
            source,
            build,
            mut deploy,
            debug,
        } = request;

        if build.is_none() && deploy.is_none() {
            return Err(ManagerError::EmptyOrder);
        }

        let header = Header::new(OrderId::generate(), debug);

        if let Some(build) = &build {
            if self.storage.get_target(&build.host).await?.is_none() {
                return Err(ManagerError::UnknownBuildHost(build.host.clone()));
            }
        }

        if let Some(deploy) = deploy.as_mut() {
            let matched = self
                .storage
                .match_targets(&deploy.target.ids, &deploy.target.tags)
                .await?;
            let list: Vec<TargetId> = matched.receivers.iter().map(|t| t.id.clone()).collect();
            if list.is_empty() {
                return Err(ManagerError::NoMatchingTargets);
            }
            deploy.matched = Some(Match {
                ids: matched.hit_ids,
                tags: matched.hit_tags,
                list,
            });
        }

        let order_dir = self.order_dir(&header.id);
        tokio::fs::create_dir_all(&order_dir).await?;
        if let Some(source) = source {
            source.stage(&order_dir).await?;
        }
        // The staging descriptor is not persisted; the staged files are.

        let order = Order {
            header,
            build,
            deploy,
        };
        self.storage.add_order(&order).await?;

        info!(order_id = %order.header.id, "order accepted");

        let manager = Arc::clone(self);
        let composed = order.clone();
        spawn_guarded("compose", async move {
            manager.compose_task(composed).await;
        });

        Ok(order)
    }

    /// Produce and dispatch the order's next task. Build legs are sent to
    /// the assembler; the deploy leg follows once the package returns.
    pub async fn compose_task(&self, order: Order) {
        let header = order.header.clone();

        if let Some(build) = &order.build {
            let matched = Match::single(build.host.clone());
            let task = Task {
                header: header.clone(),
                build: Some(build.commands.clone()),
                deploy: None,
                artifacts: Vec::new(),
            };
            self.dispatch_leg(task, matched).await;
        } else if let Some(deploy) = &order.deploy {
            let Some(matched) = deploy.matched.clone() else {
                warn!(order_id = %header.id, "deploy leg has no resolved match");
                return;
            };
            let task = Task {
                header: header.clone(),
                build: None,
                deploy: Some(deploy.commands.clone()),
                artifacts: Vec::new(),
            };
            self.dispatch_leg(task, matched).await;

            // Final leg delivered; order disk is no longer needed.
            let order_dir = self.order_dir(&header.id);
            if let Err(e) = tokio::fs::remove_dir_all(&order_dir).await {
                debug!(order_id = %header.id, error = %e, "order directory cleanup skipped");
            }
        }
    }

    /// Compress artifacts for one leg and run the send/confirm loop,
    /// converting failures into transfer-stage error logs.
    async fn dispatch_leg(&self, mut task: Task, matched: Match) {
        let header = task.header.clone();

        match self.collect_artifacts(&header.id).await {
            Ok(artifacts) => task.artifacts = artifacts,
            Err(e) => {
                error!(order_id = %header.id, error = %e, "artifact compression failed");
                self.transfer_failure(&header, &matched.list, &e).await;
                return;
            }
        }

        if let Err(e) = self.send_task(&task, &matched).await {
            error!(order_id = %header.id, error = %e, "task delivery failed");
            self.transfer_failure(&header, &matched.list, &e).await;
        }
    }

    /// The announce/send/confirm loop.
    ///
    /// The pub/sub transport is lossy while subscribers are absent, so the
    /// announcement gives agents a window to subscribe to the task topic
    /// before the body is published, and storage is probed for a log from
    /// every receiver before the loop exits. Redelivery is harmless:
    /// agents dedupe by task ID.
    pub async fn send_task(&self, task: &Task, matched: &Match) -> ManagerResult<()> {
        let mut topics = Vec::new();
        for id in &matched.ids {
            topics.push(Topic::id(id.clone())?);
        }
        for tag in &matched.tags {
            topics.push(Topic::tag(tag.clone())?);
        }
        if topics.is_empty() || matched.list.is_empty() {
            debug!(order_id = %task.header.id, "no receivers, nothing to send");
            return Ok(());
        }

        let announcement = RequestWrapper::announcement(task.announcement());
        let payload = serde_json::to_vec(task)?;
        let task_topic = Topic::Task(task.header.id.clone());

        let orchestration = &self.config.orchestration;
        let mut backoff = orchestration.backoff_base();
        let mut round = 0u32;

        loop {
            if self.all_delivered(&matched.list, &task.header.id).await? {
                break;
            }

            round += 1;
            debug!(order_id = %task.header.id, round, "announcing task");

            for topic in &topics {
                let message = Message::json(topic, &announcement)?;
                self.requests
                    .send(message)
                    .await
                    .map_err(|_| ManagerError::PipeClosed)?;
            }

            tokio::time::sleep(orchestration.announce_delay()).await;

            self.requests
                .send(Message::new(task_topic.render(), payload.clone()))
                .await
                .map_err(|_| ManagerError::PipeClosed)?;

            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff + orchestration.backoff_step(), orchestration.backoff_cap());
        }

        info!(order_id = %task.header.id, "task received by all targets");

        let time = UnixTime::now();
        let logs: Vec<LogRecord> = matched
            .list
            .iter()
            .map(|target| LogRecord {
                task: task.header.id.clone(),
                target: target.clone(),
                stage: Stage::Transfer,
                command: COMMAND_BY_MANAGER.to_owned(),
                output: STAGE_END.to_owned(),
                error: false,
                time,
                debug: task.header.debug,
            })
            .collect();
        self.storage.add_logs(&logs).await?;
        self.events.publish(EVENT_LOGS, &logs);

        Ok(())
    }

    /// True when every receiver still known to storage has logged the
    /// task. Targets removed from storage drop out of the probe; an empty
    /// post-filter set counts as delivered, which is the operator's path
    /// for killing a stuck order.
    async fn all_delivered(&self, list: &[TargetId], task: &OrderId) -> ManagerResult<bool> {
        for target in list {
            if self.storage.get_target(target).await?.is_none() {
                continue;
            }
            if !self.storage.delivered_task(target, task).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Demux loop over the response stream. Every frame is handled on its
    /// own guarded task so a malformed message never stops the demux.
    pub async fn manage_responses(self: Arc<Self>, mut responses: mpsc::Receiver<Message>) {
        while let Some(message) = responses.recv().await {
            let manager = Arc::clone(&self);
            spawn_guarded("response", async move {
                manager.dispatch_response(message).await;
            });
        }
        info!("response stream closed");
    }

    async fn dispatch_response(&self, message: Message) {
        match message.topic.as_str() {
            TOPIC_ADVERTISEMENT => self.process_target(&message.payload).await,
            TOPIC_PACKAGE => self.process_package(&message.payload).await,
            _ => self.process_response(&message.payload).await,
        }
    }

    /// Patch-or-insert the advertised target.
    async fn process_target(&self, payload: &[u8]) {
        let advertisement: TargetAdvertisement = match serde_json::from_slice(payload) {
            Ok(advertisement) => advertisement,
            Err(e) => {
                warn!(error = %e, "malformed advertisement, dropping");
                return;
            }
        };

        let result = async {
            match self.storage.get_target(&advertisement.id).await? {
                Some(mut existing) => {
                    existing.tags = advertisement.tags.clone();
                    existing.updated_at = UnixTime::now();
                    self.storage.patch_target(&advertisement.id, &existing).await?;
                    self.events.publish(EVENT_TARGET_UPDATED, &existing);
                }
                None => {
                    let target = Target::new(advertisement.id.clone(), advertisement.tags.clone());
                    self.storage.add_target(&target).await?;
                    info!(target_id = %target.id, "target added");
                    self.events.publish(EVENT_TARGET_ADDED, &target);
                    self.events.publish(EVENT_TARGET_UPDATED, &target);
                }
            }
            Ok::<(), ManagerError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(target_id = %advertisement.id, error = %e, "error processing advertisement");
        }
    }

    /// Ingest an assembler package: unpack it, clear the build leg, ack
    /// the assembler, and re-enter compose for the deploy leg.
    async fn process_package(&self, payload: &[u8]) {
        let package: Package = match serde_json::from_slice(payload) {
            Ok(package) => package,
            Err(e) => {
                warn!(error = %e, "malformed package, dropping");
                return;
            }
        };

        info!(
            order_id = %package.task,
            assembler = %package.assembler,
            size = package.payload.len(),
            "package received"
        );

        let package_dir = self.order_dir(&package.task).join("package");
        if let Err(e) = decompress_files(package.payload.clone(), &package_dir).await {
            warn!(order_id = %package.task, error = %e, "unable to unpack package");
            return;
        }

        let result = async {
            let Some(mut order) = self.storage.get_order(&package.task).await? else {
                warn!(order_id = %package.task, "package for unknown order");
                return Ok(());
            };

            order.build = None;
            self.storage.add_order(&order).await?;

            let ack = RequestWrapper::package_ack(package.task.clone());
            let topic = Topic::id(package.assembler.clone())?;
            self.requests
                .send(Message::json(&topic, &ack)?)
                .await
                .map_err(|_| ManagerError::PipeClosed)?;

            if order.deploy.is_some() {
                self.compose_task(order).await;
            }
            Ok::<(), ManagerError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(order_id = %package.task, error = %e, "error processing package");
        }
    }

    /// Ingest an ordinary log response.
    async fn process_response(&self, payload: &[u8]) {
        let response: Response = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "malformed response, dropping");
                return;
            }
        };

        let mut logs = response.logs;
        for log in &mut logs {
            log.target = response.target_id.clone();
        }

        let result = async {
            if response.on_request {
                if let Some(last) = logs.last() {
                    if let Some(mut target) = self.storage.get_target(&response.target_id).await? {
                        if last.time > target.log_request_at {
                            target.log_request_at = last.time;
                            self.storage.patch_target(&response.target_id, &target).await?;
                        }
                    }
                }
            }

            if !logs.is_empty() {
                self.storage.add_logs(&logs).await?;
                self.events.publish(EVENT_LOGS, &logs);
            }
            Ok::<(), ManagerError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(target_id = %response.target_id, error = %e, "error processing response");
        }
    }

    /// Ask a target for all logs newer than its backfill watermark.
    pub async fn request_logs(&self, target_id: &TargetId) -> ManagerResult<()> {
        let target = self
            .storage
            .get_target(target_id)
            .await?
            .ok_or_else(|| ManagerError::UnknownTarget(target_id.clone()))?;

        let request = RequestWrapper::log_request(convoy_model::LogRequest {
            if_modified_since: target.log_request_at,
        });
        let topic = Topic::id(target.id)?;
        self.requests
            .send(Message::json(&topic, &request)?)
            .await
            .map_err(|_| ManagerError::PipeClosed)
    }

    /// Compress the order's artifact root: the unpacked package for a
    /// redeploy after the assembler round-trip, the staged source
    /// otherwise. No root means no artifacts.
    async fn collect_artifacts(&self, id: &OrderId) -> ManagerResult<Vec<u8>> {
        let order_dir = self.order_dir(id);
        let package_root = order_dir.join("package").join(SOURCE_DIR);
        let source_root = order_dir.join(SOURCE_DIR);

        let root = if package_root.is_dir() {
            package_root
        } else if source_root.is_dir() {
            source_root
        } else {
            return Ok(Vec::new());
        };

        Ok(compress_files(&root).await?)
    }

    /// Record a leg failure as transfer-stage logs: one error line plus a
    /// terminal stage end, per affected target.
    async fn transfer_failure(&self, header: &Header, targets: &[TargetId], error: &ManagerError) {
        let time = UnixTime::now();
        let mut logs = Vec::with_capacity(targets.len() * 2);
        for target in targets {
            logs.push(LogRecord {
                task: header.id.clone(),
                target: target.clone(),
                stage: Stage::Transfer,
                command: COMMAND_BY_MANAGER.to_owned(),
                output: error.to_string(),
                error: true,
                time,
                debug: header.debug,
            });
            logs.push(LogRecord {
                task: header.id.clone(),
                target: target.clone(),
                stage: Stage::Transfer,
                command: COMMAND_BY_MANAGER.to_owned(),
                output: STAGE_END.to_owned(),
                error: true,
                time,
                debug: header.debug,
            });
        }

        if let Err(e) = self.storage.add_logs(&logs).await {
            warn!(order_id = %header.id, error = %e, "unable to record transfer failure");
            return;
        }
        self.events.publish(EVENT_LOGS, &logs);
    }

    fn order_dir(&self, id: &OrderId) -> PathBuf {
        self.config.paths.work_dir.join("orders").join(id.as_str())
    }
}

/// Spawn a background task behind a recovery guard: a panic is logged and
/// absorbed so one order's bug never stops the manager.
pub fn spawn_guarded<F>(task: &'static str, future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(future).catch_unwind().await.is_err() {
            error!(task, "background task panicked");
        }
    });
}

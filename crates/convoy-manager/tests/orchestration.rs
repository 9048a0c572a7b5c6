//! End-to-end orchestration scenarios over the in-process broker: a real
//! manager, real installer agents, and the lossy publish/subscribe pipe
//! between them.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use convoy_agent::{spawn_responder, Installer, InstallerOptions};
use convoy_manager::config::OrchestrationConfig;
use convoy_manager::{
    EventBus, LogFilter, Manager, ManagerConfig, ManagerError, MemoryStorage, OrderRequest,
    Source, Storage,
};
use convoy_model::{
    Build, Deploy, DeployCommands, LogRecord, OrderId, Stage, Target, TargetId, TargetSelector,
    Topic, UnixTime, TOPIC_ALL,
};
use convoy_pipe::{pipe, MemoryBroker};

struct Cluster {
    manager: Arc<Manager>,
    storage: Arc<MemoryStorage>,
    broker: MemoryBroker,
    cancel: CancellationToken,
    _work: TempDir,
    agent_dirs: Vec<TempDir>,
}

impl Cluster {
    async fn start() -> Self {
        let work = TempDir::new().expect("tempdir");
        let mut config = ManagerConfig::default();
        config.paths.work_dir = work.path().to_owned();
        config.orchestration = OrchestrationConfig {
            announce_delay_ms: 20,
            backoff_base_ms: 300,
            backoff_step_ms: 100,
            backoff_cap_ms: 500,
        };

        let storage = Arc::new(MemoryStorage::new());
        let (core, backend) = pipe(128);
        let broker = MemoryBroker::start(backend, 128);

        let (manager, responses) = Manager::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            core,
            EventBus::new(128),
            config,
        );
        tokio::spawn(Arc::clone(&manager).manage_responses(responses));

        Self {
            manager,
            storage,
            broker,
            cancel: CancellationToken::new(),
            _work: work,
            agent_dirs: Vec::new(),
        }
    }

    /// Attach a live installer agent and register its target.
    async fn attach_agent(&mut self, id: &str, tags: &[&str]) {
        let target_id = TargetId::new(id);
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_owned()).collect();

        let mut subscriptions = vec![
            TOPIC_ALL.to_owned(),
            Topic::id(target_id.clone()).expect("topic").render(),
        ];
        for tag in &tags {
            subscriptions.push(Topic::tag(tag.clone()).expect("topic").render());
        }
        let conn = self.broker.attach(subscriptions);

        let agent_dir = TempDir::new().expect("tempdir");
        let responder = spawn_responder(
            target_id.clone(),
            conn.sender(),
            Duration::from_millis(20),
        );
        let installer = Installer::new(
            InstallerOptions {
                target_id: target_id.clone(),
                work_dir: agent_dir.path().to_owned(),
                stop_grace: Duration::from_secs(1),
            },
            conn.sender(),
            responder,
            self.cancel.clone(),
        );
        tokio::spawn(installer.run(conn));
        self.agent_dirs.push(agent_dir);

        // Registration normally happens via the advertiser; seed it
        // directly so intake can match immediately.
        self.storage
            .add_target(&Target::new(target_id, tags))
            .await
            .expect("register target");
    }

    async fn wait_for_logs<F>(&self, task: &OrderId, predicate: F) -> Vec<LogRecord>
    where
        F: Fn(&[LogRecord]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (logs, _) = self
                .storage
                .get_logs(
                    &LogFilter::new()
                        .with_task(task.clone())
                        .sorted(convoy_manager::LogSortField::Time, true),
                )
                .await
                .expect("logs");
            if predicate(&logs) {
                return logs;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached; logs so far: {logs:#?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn deploy_leg(ids: &[&str], tags: &[&str], install: &[&str]) -> Deploy {
    Deploy {
        target: TargetSelector {
            ids: ids.iter().map(|id| TargetId::new(*id)).collect(),
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
        },
        commands: DeployCommands {
            install: install.iter().map(|c| (*c).to_owned()).collect(),
            run: Vec::new(),
        },
        matched: None,
    }
}

fn install_end(logs: &[LogRecord]) -> Option<&LogRecord> {
    logs.iter()
        .find(|log| log.stage == Stage::Install && log.is_stage_end())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deploy_only_single_target() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("t1", &[]).await;

    let order = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&["t1"], &[], &["echo hi"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    let id = order.header.id.clone();

    let logs = cluster
        .wait_for_logs(&id, |logs| {
            install_end(logs).is_some()
                && logs
                    .iter()
                    .any(|log| log.stage == Stage::Transfer && log.is_stage_end())
        })
        .await;

    let hello = logs
        .iter()
        .find(|log| log.output == "hi")
        .expect("install output");
    assert_eq!(hello.stage, Stage::Install);
    assert_eq!(hello.target, TargetId::new("t1"));
    assert!(!hello.error);

    let terminal = install_end(&logs).expect("terminal");
    assert!(!terminal.error);

    // Exactly one install-stage terminal record for the pair.
    let terminals = logs
        .iter()
        .filter(|log| log.stage == Stage::Install && log.is_stage_end())
        .count();
    assert_eq!(terminals, 1);

    assert!(cluster
        .storage
        .delivered_task(&TargetId::new("t1"), &id)
        .await
        .expect("probe"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_deployment_is_rejected_and_silent() {
    let cluster = Cluster::start().await;

    let result = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&[], &["none"], &["echo hi"])),
            ..OrderRequest::default()
        })
        .await;

    match result {
        Err(ManagerError::NoMatchingTargets) => {}
        other => panic!("expected rejection, got {other:?}"),
    }

    // Nothing was persisted or published.
    let (orders, total) = cluster.storage.get_orders(0, 10).await.expect("orders");
    assert!(orders.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn build_then_deploy_round_trip() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("b1", &[]).await;
    cluster.attach_agent("t1", &[]).await;

    // Stage a real source tree so the assembler has something to build on.
    let input = TempDir::new().expect("tempdir");
    std::fs::write(input.path().join("version.txt"), "7").expect("write");

    let order = cluster
        .manager
        .add_order(OrderRequest {
            source: Some(Source::Paths {
                list: vec![input.path().join("version.txt")],
            }),
            build: Some(Build {
                host: TargetId::new("b1"),
                commands: vec!["echo built-$(cat src/version.txt) > src/artifact.txt".to_owned()],
            }),
            deploy: Some(deploy_leg(&["t1"], &[], &["cat src/artifact.txt"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    let id = order.header.id.clone();

    // The assembler builds, the package comes back, and the deploy leg
    // carries the built artifact to t1.
    let logs = cluster
        .wait_for_logs(&id, |logs| {
            logs.iter()
                .any(|log| log.target == TargetId::new("t1") && log.output == "built-7")
        })
        .await;

    let built = logs
        .iter()
        .find(|log| log.target == TargetId::new("t1") && log.output == "built-7")
        .expect("deploy output");
    assert_eq!(built.stage, Stage::Install);

    // The stored order had its build leg cleared exactly once.
    let stored = cluster
        .storage
        .get_order(&id)
        .await
        .expect("get")
        .expect("present");
    assert!(stored.build.is_none());
    assert!(stored.deploy.is_some());

    // Both legs delivered.
    assert!(cluster
        .storage
        .delivered_task(&TargetId::new("b1"), &id)
        .await
        .expect("probe"));
    assert!(cluster
        .storage
        .delivered_task(&TargetId::new("t1"), &id)
        .await
        .expect("probe"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_failure_stops_the_sequence() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("t1", &[]).await;

    let order = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&["t1"], &[], &["false", "echo never"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    let id = order.header.id.clone();

    let logs = cluster
        .wait_for_logs(&id, |logs| install_end(logs).is_some())
        .await;

    assert!(logs
        .iter()
        .any(|log| log.output == "exit status 1" && log.error));
    assert!(!logs.iter().any(|log| log.output == "never"));

    let terminal = install_end(&logs).expect("terminal");
    assert!(terminal.error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn absent_target_blocks_until_the_operator_removes_it() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("t1", &[]).await;

    // A second matched target that never runs an agent.
    cluster
        .storage
        .add_target(&Target::new(TargetId::new("ghost"), Vec::new()))
        .await
        .expect("register ghost");

    let order = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&["t1", "ghost"], &[], &["echo hi"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    let id = order.header.id.clone();

    // t1 reports, the ghost never does: the loop keeps retrying and no
    // transfer end is recorded.
    cluster
        .wait_for_logs(&id, |logs| {
            logs.iter().any(|log| log.target == TargetId::new("t1"))
        })
        .await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    let (logs, _) = cluster
        .storage
        .get_logs(&LogFilter::new().with_task(id.clone()).with_stage(Stage::Transfer))
        .await
        .expect("logs");
    assert!(logs.is_empty());

    // Operator intervention: marking the ghost delivered unblocks the
    // confirm loop on its next probe.
    cluster
        .storage
        .add_logs(&[LogRecord {
            task: id.clone(),
            target: TargetId::new("ghost"),
            stage: Stage::Transfer,
            command: convoy_model::COMMAND_BY_MANAGER.to_owned(),
            output: "operator override".to_owned(),
            error: true,
            time: UnixTime::now(),
            debug: false,
        }])
        .await
        .expect("override");

    cluster
        .wait_for_logs(&id, |logs| {
            logs.iter()
                .any(|log| log.stage == Stage::Transfer && log.is_stage_end())
        })
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_backfill_advances_the_watermark() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("t1", &[]).await;

    let order = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&["t1"], &[], &["echo hi"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    cluster
        .wait_for_logs(&order.header.id, |logs| install_end(logs).is_some())
        .await;

    let before = cluster
        .storage
        .get_target(&TargetId::new("t1"))
        .await
        .expect("get")
        .expect("present");
    assert_eq!(before.log_request_at, UnixTime::ZERO);

    cluster
        .manager
        .request_logs(&TargetId::new("t1"))
        .await
        .expect("request");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let target = cluster
            .storage
            .get_target(&TargetId::new("t1"))
            .await
            .expect("get")
            .expect("present");
        if target.log_request_at > UnixTime::ZERO {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("watermark never advanced");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deployment_by_tag_reaches_every_carrier() {
    let mut cluster = Cluster::start().await;
    cluster.attach_agent("t1", &["edge"]).await;
    cluster.attach_agent("t2", &["edge"]).await;
    cluster.attach_agent("t3", &["core"]).await;

    let order = cluster
        .manager
        .add_order(OrderRequest {
            deploy: Some(deploy_leg(&[], &["edge"], &["echo tagged"])),
            ..OrderRequest::default()
        })
        .await
        .expect("intake");
    let id = order.header.id.clone();

    let logs = cluster
        .wait_for_logs(&id, |logs| {
            let done = |target: &str| {
                logs.iter().any(|log| {
                    log.target == TargetId::new(target)
                        && log.stage == Stage::Install
                        && log.is_stage_end()
                })
            };
            done("t1") && done("t2")
        })
        .await;

    assert!(!logs.iter().any(|log| log.target == TargetId::new("t3")));
}

//! Convoy agent binary.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use convoy_agent::{advertiser, spawn_responder, AgentConfig, Installer, InstallerOptions};
use convoy_model::{TargetId, Topic, TOPIC_ALL};
use convoy_pipe::client::{connect, PipeClientConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("convoy_agent=info".parse()?))
        .init();

    info!("convoy agent starting");

    let config = AgentConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        AgentConfig::default()
    });

    let target_id = TargetId::new(config.target_id.clone());
    info!(target_id = %target_id, tags = ?config.tags, "agent identity");

    let key = match &config.key_file {
        Some(path) => tokio::fs::read_to_string(path).await?.trim().to_owned(),
        None => String::new(),
    };

    let mut subscriptions = vec![
        TOPIC_ALL.to_owned(),
        Topic::id(target_id.clone())?.render(),
    ];
    for tag in &config.tags {
        subscriptions.push(Topic::tag(tag.clone())?.render());
    }

    let conn = connect(PipeClientConfig {
        publish_addr: config.manager.publish_addr,
        collect_addr: config.manager.collect_addr,
        key,
        subscriptions,
        queue: config.queue,
    })
    .await?;
    info!(manager = %config.manager.publish_addr, "connected to manager");

    tokio::fs::create_dir_all(config.work_dir.join("tasks")).await?;

    let cancel = CancellationToken::new();

    let responder = spawn_responder(target_id.clone(), conn.sender(), config.flush_interval());

    tokio::spawn(advertiser::run(
        target_id.clone(),
        config.tags.clone(),
        conn.sender(),
        config.advertise_interval(),
        cancel.clone(),
    ));

    let installer = Installer::new(
        InstallerOptions {
            target_id,
            work_dir: config.work_dir.clone(),
            stop_grace: config.stop_grace(),
        },
        conn.sender(),
        responder,
        cancel.clone(),
    );
    let runner = tokio::spawn(installer.run(conn));

    shutdown_signal().await;
    info!("shutting down");
    cancel.cancel();
    if let Err(e) = runner.await {
        error!(error = %e, "installer task failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

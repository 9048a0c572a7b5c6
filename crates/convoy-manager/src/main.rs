//! Convoy manager binary.
//!
//! Wires the storage, the pipe transport and the orchestration core, then
//! runs until interrupted.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use convoy_manager::{EventBus, Manager, ManagerConfig, MemoryStorage, Storage};
use convoy_pipe::server::{PipeServer, PipeServerConfig};
use convoy_pipe::{auth, pipe};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("convoy_manager=info".parse()?),
        )
        .init();

    info!("convoy manager starting");

    let config = ManagerConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ManagerConfig::default()
    });

    let server_config =
        PipeServerConfig::from_env(config.pipe.publish_addr, config.pipe.collect_addr);

    if server_config.auth {
        // Both key files must be present when admission is on; the public
        // key is what operators hand to agents.
        let private_key = auth::read_key_file(auth::ENV_PRIVATE_KEY, auth::DEFAULT_PRIVATE_KEY_PATH)?;
        auth::decode_key(&private_key)?;
        let public_key = auth::read_key_file(auth::ENV_PUBLIC_KEY, auth::DEFAULT_PUBLIC_KEY_PATH)?;
        info!(public_key = %public_key, "loaded server keypair");
    }

    let (pipe, backend) = pipe(config.pipe.queue);
    let server = PipeServer::start(server_config, backend).await?;
    info!(
        publish = %server.publish_addr(),
        collect = %server.collect_addr(),
        "pipe transport up"
    );

    tokio::fs::create_dir_all(config.paths.work_dir.join("orders")).await?;

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let events = EventBus::new(config.events.capacity);
    let (manager, responses) = Manager::new(storage, pipe, events, config);

    let demux = Arc::clone(&manager);
    tokio::spawn(demux.manage_responses(responses));

    shutdown_signal().await;
    info!("shutting down");
    server.shutdown();

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

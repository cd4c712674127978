// ABOUTME: Sandbox daemon entry point wiring configuration, Docker and background cleanup
// ABOUTME: Runs until ctrl-c or SIGTERM, then stops every scheduled task once

use anyhow::Context;
use futures::FutureExt;
use sandbox_engine::{DockerEngine, Engine, SandboxConfig, SandboxManager, TaskScheduler};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const IDLE_CLEANUP_TASK: &str = "idle_sandbox_cleanup";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SandboxConfig::load(None).context("failed to load configuration")?;
    let engine: Arc<dyn Engine> =
        Arc::new(DockerEngine::connect().context("failed to connect to Docker")?);
    let manager = Arc::new(
        SandboxManager::initialize(engine, config.clone())
            .await
            .context("failed to initialize sandbox manager")?,
    );

    let scheduler = TaskScheduler::new();
    if config.cleanup.enabled {
        let max_idle = config.cleanup.max_idle();
        let cleanup_manager = manager.clone();
        scheduler
            .start(IDLE_CLEANUP_TASK, config.cleanup.interval(), move || {
                let manager = cleanup_manager.clone();
                async move {
                    let removed = manager.cleanup_idle(max_idle).await;
                    if !removed.is_empty() {
                        info!(count = removed.len(), "Idle sandbox cleanup removed sandboxes");
                    }
                    anyhow::Ok(())
                }
                .boxed()
            })
            .await;
    } else {
        warn!("Idle sandbox cleanup is disabled");
    }

    info!(
        host = %config.server.host,
        port = config.server.port,
        base_url = %config.server.public_base_url(),
        "Sandbox engine ready"
    );

    shutdown_signal().await;
    info!("Shutting down");
    scheduler.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

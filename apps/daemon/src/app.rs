//! Application orchestrator: wires storage, coordinator, sweeper and server.

use std::sync::Arc;
use std::time::Duration;

use chunkvault_server::{ServerConfig, TransferHandler, TransferServer};
use chunkvault_transfer::{
    CoordinatorConfig, FsChunkStore, FsJournal, FsObjectSink, TransferCoordinator,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the daemon until Ctrl-C or a server failure.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let coordinator = Arc::new(build_coordinator(&config));
    let restored = coordinator.recover().await?;
    tracing::info!(restored, "session journal replayed");

    let sweeper = spawn_sweeper(
        Arc::clone(&coordinator),
        config.sweep_interval(),
        config.max_idle(),
        cancel.child_token(),
    );

    let server_config = ServerConfig {
        port: config.port,
        max_connections: config.max_connections,
    };
    let server = TransferServer::with_cancel(
        server_config,
        TransferHandler::new(Arc::clone(&coordinator)),
        cancel.child_token(),
    );
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!("daemon ready");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("server error: {e}")),
                Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
            }
        }
    };

    tracing::info!("stopping services...");
    cancel.cancel();
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    let _ = sweeper.await;
    tracing::info!(active = coordinator.active_count(), "open transfers left for resume");

    outcome
}

/// Builds a coordinator backed by `<storage_dir>/{chunks,sessions,objects}`.
fn build_coordinator(config: &Config) -> TransferCoordinator {
    let root = &config.storage_dir;
    TransferCoordinator::new(
        Arc::new(FsChunkStore::new(root.join("chunks"))),
        Arc::new(FsJournal::new(root.join("sessions"))),
        Arc::new(FsObjectSink::new(root.join("objects"))),
        CoordinatorConfig {
            chunk_size_hint: config.chunk_size_hint,
            retired_capacity: config.retired_capacity,
        },
    )
}

/// Periodically fails transfers idle for longer than `max_idle`.
fn spawn_sweeper(
    coordinator: Arc<TransferCoordinator>,
    every: Duration,
    max_idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = coordinator.expire_stale(chrono::Utc::now(), max_idle).await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired stale transfers");
                    }
                }
            }
        }
    })
}

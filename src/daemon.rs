//! Daemon assembly and lifecycle.
//!
//! Builds the registries, storage pools, notifier fanout, scheduler and
//! coordinator, wires the ambient cancellation token through all of them,
//! and runs the shutdown sequence on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{DaemonArgs, DaemonConfig};
use crate::coordinator::Coordinator;
use crate::docker::{DockerClient, Watcher};
use crate::notify::{create_notifier, Fanout};
use crate::producer::ProducerRegistry;
use crate::scheduler::Scheduler;
use crate::storage::PoolManager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(args: DaemonArgs, socket_path: PathBuf) -> anyhow::Result<()> {
    let env: Vec<(String, String)> = std::env::vars().collect();
    let config = DaemonConfig::resolve(&args, socket_path, &env)?;

    info!(
        docker_host = %config.docker_host,
        poll_interval = ?config.poll_interval,
        "starting backup daemon"
    );

    if config.storage_pools.is_empty() {
        anyhow::bail!("no storage pools configured, use --storage to configure at least one");
    }
    for (name, pool) in &config.storage_pools {
        info!(name = %name, pool_type = %pool.pool_type, "storage pool configured");
    }

    // Notifiers are optional; a broken one fails startup so label references
    // stay meaningful.
    let mut fanout = Fanout::new();
    for (name, notify_config) in &config.notify_configs {
        let notifier = create_notifier(&notify_config.notifier_type, name, &notify_config.options)
            .with_context(|| format!("failed to create notifier {name:?}"))?;
        fanout.add(name, notifier);
        info!(name = %name, notifier_type = %notify_config.notifier_type, "notification provider configured");
    }
    let fanout = Arc::new(fanout);

    let pools = Arc::new(
        PoolManager::new(&config.storage_pools, &config.default_storage)
            .context("failed to initialize storage pools")?,
    );

    let docker = Arc::new(
        DockerClient::connect(&config.docker_host)
            .await
            .context("failed to connect to Docker")?,
    );

    let scheduler = Arc::new(Scheduler::new().await?);
    let producers = Arc::new(ProducerRegistry::builtin());

    let token = CancellationToken::new();
    let coordinator = Coordinator::new(
        docker.clone(),
        pools,
        scheduler.clone(),
        producers,
        fanout,
        token.clone(),
    );

    // Control socket.
    let api_handle = tokio::spawn(api::server::serve(
        config.socket_path.clone(),
        coordinator.clone(),
        token.clone(),
    ));

    // Optional dashboard listener.
    let dashboard_handle = config.dashboard_addr.clone().map(|addr| {
        tokio::spawn(api::dashboard::serve(addr, coordinator.clone(), token.clone()))
    });

    scheduler.start().await?;

    coordinator
        .initial_sync()
        .await
        .context("initial container sync failed")?;

    let watcher = Watcher::new(docker, config.poll_interval);
    let events = watcher.start(token.clone());
    let coordinator_handle = tokio::spawn(coordinator.clone().run(events));

    shutdown_signal().await;
    info!("received shutdown signal");

    token.cancel();

    if let Err(err) = scheduler.shutdown().await {
        warn!(error = %err, "scheduler shutdown error");
    }

    // Bounded grace period for the event loop and the servers.
    if tokio::time::timeout(SHUTDOWN_GRACE, coordinator_handle)
        .await
        .is_err()
    {
        warn!("coordinator did not stop within the grace period");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, api_handle).await {
        Ok(Ok(Err(err))) => error!(error = %err, "API server error"),
        Ok(Err(err)) => error!(error = %err, "API server task panicked"),
        Err(_) => warn!("API server did not stop within the grace period"),
        _ => {}
    }
    if let Some(handle) = dashboard_handle {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(Err(err))) => error!(error = %err, "dashboard server error"),
            Ok(Err(err)) => error!(error = %err, "dashboard server task panicked"),
            Err(_) => warn!("dashboard server did not stop within the grace period"),
            _ => {}
        }
    }

    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

//! Optional read-only dashboard endpoint.
//!
//! Serves the same JSON views as the control socket (`/api/containers`,
//! `/api/jobs`) on a TCP address for an external dashboard to consume.
//! Rendering and authentication live outside the daemon.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::{Coordinator, ScheduledJob};
use crate::labels::ContainerPlan;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/containers", get(containers))
        .route("/api/jobs", get(jobs))
        .with_state(coordinator)
}

pub async fn serve(
    addr: String,
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "dashboard listening");

    let shutdown_token = token.clone();
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    Ok(())
}

async fn containers(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ContainerPlan>> {
    Json(coordinator.containers().await)
}

async fn jobs(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ScheduledJob>> {
    Json(coordinator.jobs().await)
}

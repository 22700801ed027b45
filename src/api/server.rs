//! Control-plane HTTP server on a local Unix socket.
//!
//! The socket file is recreated on bind and restricted to the daemon's
//! user/group (0660). All endpoints speak JSON; errors carry an HTTP status
//! from the error kind plus a structured `error` string in the body.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DeleteResponse, ListResponse, RestoreResponse, RunResponse};
use crate::coordinator::{Coordinator, ScheduledJob};
use crate::labels::ContainerPlan;

#[derive(Clone)]
struct ApiState {
    coordinator: Arc<Coordinator>,
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/backup/run/{container}", post(run_backup))
        .route("/backup/list/{container}", get(list_backups))
        .route("/backup/delete/{container}/{*key}", delete(delete_backup))
        .route("/backup/restore/{container}/{*key}", post(restore_backup))
        .route("/containers", get(containers))
        .route("/jobs", get(jobs))
        .with_state(ApiState { coordinator })
}

/// Binds the control socket and serves until the token is cancelled.
pub async fn serve(
    socket_path: PathBuf,
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    // A stale socket from a previous run blocks the bind.
    let _ = std::fs::remove_file(&socket_path);

    let listener = tokio::net::UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o660))?;

    info!(socket = %socket_path.display(), "control API listening");

    let shutdown_token = token.clone();
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[derive(Deserialize)]
struct RunQuery {
    config: Option<String>,
}

async fn run_backup(
    State(state): State<ApiState>,
    Path(container): Path<String>,
    Query(query): Query<RunQuery>,
) -> (StatusCode, Json<RunResponse>) {
    info!(container = %container, "backup triggered via API");

    match state
        .coordinator
        .trigger_backup(&container, query.config.as_deref())
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(RunResponse {
                success: true,
                container,
                message: Some("backup completed successfully".to_string()),
                error: None,
            }),
        ),
        Err(err) => (
            err.status_code(),
            Json(RunResponse {
                success: false,
                container,
                message: None,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn list_backups(
    State(state): State<ApiState>,
    Path(container): Path<String>,
) -> (StatusCode, Json<ListResponse>) {
    match state.coordinator.list_backups(&container).await {
        Ok(backups) => (
            StatusCode::OK,
            Json(ListResponse {
                success: true,
                container,
                backups,
                error: None,
            }),
        ),
        Err(err) => (
            err.status_code(),
            Json(ListResponse {
                success: false,
                container,
                backups: Vec::new(),
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn delete_backup(
    State(state): State<ApiState>,
    Path((container, key)): Path<(String, String)>,
) -> (StatusCode, Json<DeleteResponse>) {
    info!(container = %container, key = %key, "backup delete requested via API");

    match state.coordinator.delete_backup(&container, &key).await {
        Ok(()) => (
            StatusCode::OK,
            Json(DeleteResponse {
                success: true,
                container,
                key,
                message: Some("backup deleted successfully".to_string()),
                error: None,
            }),
        ),
        Err(err) => (
            err.status_code(),
            Json(DeleteResponse {
                success: false,
                container,
                key,
                message: None,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn restore_backup(
    State(state): State<ApiState>,
    Path((container, key)): Path<(String, String)>,
) -> (StatusCode, Json<RestoreResponse>) {
    info!(container = %container, key = %key, "backup restore requested via API");

    match state.coordinator.restore_backup(&container, &key).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RestoreResponse {
                success: true,
                container,
                key,
                message: Some("backup restored successfully".to_string()),
                error: None,
            }),
        ),
        Err(err) => (
            err.status_code(),
            Json(RestoreResponse {
                success: false,
                container,
                key,
                message: None,
                error: Some(err.to_string()),
            }),
        ),
    }
}

async fn containers(State(state): State<ApiState>) -> Json<Vec<ContainerPlan>> {
    Json(state.coordinator.containers().await)
}

async fn jobs(State(state): State<ApiState>) -> Json<Vec<ScheduledJob>> {
    Json(state.coordinator.jobs().await)
}

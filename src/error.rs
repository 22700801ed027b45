//! Error taxonomy shared across the daemon.

use axum::http::StatusCode;

use crate::labels::LabelError;

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown backup type {0:?}")]
    UnknownType(String),

    #[error("unknown storage pool {0:?}")]
    UnknownPool(String),

    #[error("no default storage pool configured")]
    NoDefaultPool,

    #[error("invalid cron schedule {0:?}")]
    InvalidSchedule(String),

    #[error("container validation failed: {0}")]
    InvalidContainer(String),

    #[error("container {0:?} is not running")]
    NotRunning(String),

    #[error("container {0:?} not found")]
    ContainerNotFound(String),

    #[error("backup {0:?} not found")]
    NotFound(String),

    #[error("docker error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Producer(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// HTTP status the control-plane API reports for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BackupError::InvalidConfig(_) | BackupError::InvalidSchedule(_) => {
                StatusCode::BAD_REQUEST
            }
            BackupError::ContainerNotFound(_) | BackupError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<LabelError> for BackupError {
    fn from(err: LabelError) -> Self {
        BackupError::InvalidConfig(err.to_string())
    }
}

impl From<object_store::Error> for BackupError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BackupError::NotFound(path),
            other => BackupError::Storage(other.to_string()),
        }
    }
}

//! Storage sinks.
//!
//! A sink is a blob store addressed by artifact keys of the form
//! `{container}/{config}/{YYYY-MM-DD}/{HHMMSS}{ext}`; the sinks themselves
//! treat keys as opaque slash-separated paths. Two backends are built in:
//! a local directory tree and S3-compatible object storage.

pub mod local;
pub mod pool;
pub mod s3;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackupError;
use crate::Result;

pub use pool::PoolManager;

/// A stored backup artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Blob-store capability implemented by every storage backend.
///
/// `delete` is idempotent: deleting an absent key succeeds. `list` returns
/// matches in no particular order; callers sort.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Stores an artifact under `key`, never appending to an existing key.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Retrieves an artifact; fails with `NotFound` when absent.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Returns all artifacts whose key begins with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BackupFile>>;

    /// Removes an artifact.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Sink types the daemon can instantiate.
pub fn sink_types() -> &'static [&'static str] {
    &["local", "s3"]
}

/// Instantiates a sink from a pool's type and options. The registry is an
/// explicit table built at process start rather than import-time side
/// effects.
pub fn create_sink(
    pool_name: &str,
    sink_type: &str,
    options: &HashMap<String, String>,
) -> Result<Arc<dyn Storage>> {
    match sink_type {
        "local" => Ok(Arc::new(local::LocalStorage::create(pool_name, options)?)),
        "s3" => Ok(Arc::new(s3::S3Storage::create(pool_name, options)?)),
        other => Err(BackupError::UnknownType(other.to_string())),
    }
}

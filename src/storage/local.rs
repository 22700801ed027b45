//! Local filesystem sink.
//!
//! Artifacts live as plain files under a base directory; the slash-separated
//! key maps directly onto the directory tree. Deletes prune empty parent
//! directories back up to (but never including) the base path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::{BackupFile, Storage};
use crate::error::BackupError;
use crate::Result;

#[derive(Debug)]
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    /// Creates the sink, requiring a `path` option and making sure the base
    /// directory exists.
    pub fn create(pool_name: &str, options: &HashMap<String, String>) -> Result<Self> {
        let path = options
            .get("path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidConfig(format!(
                    "local storage pool {pool_name:?} requires a 'path' option"
                ))
            })?;

        std::fs::create_dir_all(path)?;

        Ok(Self {
            base: PathBuf::from(path),
        })
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.full_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Err(err) = tokio::fs::write(&path, &data).await {
            // Do not leave a truncated artifact behind.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(err.into());
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BackupError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFile>> {
        let base = self.base.clone();
        let prefix = prefix.to_string();

        let files = tokio::task::spawn_blocking(move || list_files(&base, &prefix))
            .await
            .map_err(|err| BackupError::Storage(err.to_string()))??;

        Ok(files)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.full_path(key);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            // Already gone counts as success.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        // Prune now-empty parent directories; remove_dir fails on non-empty
        // directories, which ends the walk.
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.base || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }

        Ok(())
    }
}

fn list_files(base: &Path, prefix: &str) -> Result<Vec<BackupFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(base) {
        let entry = match entry {
            Ok(e) => e,
            // The base directory may not exist yet.
            Err(err) if err.io_error().map(|e| e.kind())
                == Some(std::io::ErrorKind::NotFound) =>
            {
                continue;
            }
            Err(err) => return Err(BackupError::Storage(err.to_string())),
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(base)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();

        if !prefix.is_empty() && !rel.starts_with(prefix) {
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|err| BackupError::Storage(err.to_string()))?;
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);

        files.push(BackupFile {
            key: rel,
            size: meta.len(),
            last_modified: DateTime::<Utc>::from(modified),
        });
    }

    Ok(files)
}

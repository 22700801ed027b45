//! S3-compatible sink built on `object_store`.
//!
//! Works against AWS S3 as well as MinIO-style endpoints (custom endpoint,
//! path-style addressing). An optional `prefix` option nests all artifact
//! keys under a fixed path inside the bucket; listings strip it again so the
//! rest of the daemon only ever sees bare artifact keys.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use super::{BackupFile, Storage};
use crate::error::BackupError;
use crate::Result;

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug)]
pub struct S3Storage {
    store: Box<dyn ObjectStore>,
    prefix: String,
}

impl S3Storage {
    /// Creates the sink from pool options: `bucket` (required), `region`,
    /// `endpoint`, `access-key`, `secret-key`, `path-style`, `prefix`.
    pub fn create(pool_name: &str, options: &HashMap<String, String>) -> Result<Self> {
        let bucket = options
            .get("bucket")
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidConfig(format!(
                    "s3 storage pool {pool_name:?} requires a 'bucket' option"
                ))
            })?;

        let region = options
            .get("region")
            .filter(|r| !r.is_empty())
            .map(String::as_str)
            .unwrap_or(DEFAULT_REGION);

        // from_env picks up the ambient AWS credential chain; explicit
        // options override it.
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region);

        if let (Some(access_key), Some(secret_key)) =
            (options.get("access-key"), options.get("secret-key"))
        {
            if !access_key.is_empty() && !secret_key.is_empty() {
                builder = builder
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key);
            }
        }

        if let Some(endpoint) = options.get("endpoint").filter(|e| !e.is_empty()) {
            builder = builder.with_endpoint(endpoint);
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }

        if options.get("path-style").map(String::as_str) == Some("true") {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        let store = builder
            .build()
            .map_err(|err| BackupError::InvalidConfig(err.to_string()))?;

        Ok(Self {
            store: Box::new(store),
            prefix: options.get("prefix").cloned().unwrap_or_default(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        apply_prefix(&self.prefix, key)
    }

    fn strip_prefix<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return full;
        }
        full.strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(full)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = ObjectPath::from(self.full_key(key));
        self.store.put(&path, data.into()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = ObjectPath::from(self.full_key(key));
        let result = match self.store.get(&path).await {
            Ok(r) => r,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BackupError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(result.bytes().await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BackupFile>> {
        let full = self.full_key(prefix);
        let list_prefix = (!full.is_empty()).then(|| ObjectPath::from(full));

        let mut stream = self.store.list(list_prefix.as_ref());
        let mut files = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            let location = meta.location.to_string();
            files.push(BackupFile {
                key: self.strip_prefix(&location).to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            });
        }

        Ok(files)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = ObjectPath::from(self.full_key(key));
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_prefix(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bucket_is_rejected() {
        let err = S3Storage::create("backups", &HashMap::new()).unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfig(_)));
    }

    #[test]
    fn prefix_is_applied_and_stripped() {
        assert_eq!(apply_prefix("", "a/b"), "a/b");
        assert_eq!(apply_prefix("nested", "a/b"), "nested/a/b");
        assert_eq!(apply_prefix("nested/", "a/b"), "nested/a/b");
        assert_eq!(apply_prefix("nested", ""), "nested");

        let mut options = HashMap::new();
        options.insert("bucket".to_string(), "backups".to_string());
        options.insert("prefix".to_string(), "nested".to_string());
        options.insert("region".to_string(), "eu-central-1".to_string());
        let store = S3Storage::create("backups", &options).unwrap();

        assert_eq!(store.full_key("c/db/x.tar.zst"), "nested/c/db/x.tar.zst");
        assert_eq!(store.strip_prefix("nested/c/db/x.tar.zst"), "c/db/x.tar.zst");
    }
}

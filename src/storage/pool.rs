//! Named storage pools.
//!
//! Pools are instantiated once at daemon start from configuration; the pool
//! manager resolves a plan entry's pool name (or the configured default) to
//! its sink.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StoragePool;
use crate::error::BackupError;
use crate::Result;

use super::{create_sink, Storage};

#[derive(Debug)]
pub struct PoolManager {
    pools: HashMap<String, Arc<dyn Storage>>,
    default_pool: String,
}

impl PoolManager {
    /// Builds every configured pool. If no default is given and exactly one
    /// pool exists, that pool becomes the default.
    pub fn new(pools: &HashMap<String, StoragePool>, default_pool: &str) -> Result<Self> {
        let mut built: HashMap<String, Arc<dyn Storage>> = HashMap::new();

        for (name, pool) in pools {
            let sink = create_sink(name, &pool.pool_type, &pool.options).map_err(|err| {
                match err {
                    BackupError::UnknownType(t) => BackupError::InvalidConfig(format!(
                        "unknown storage type {t:?} for pool {name:?} (available: {:?})",
                        super::sink_types()
                    )),
                    other => other,
                }
            })?;
            built.insert(name.clone(), sink);
        }

        let mut default_pool = default_pool.to_string();
        if default_pool.is_empty() && built.len() == 1 {
            default_pool = built.keys().next().cloned().unwrap_or_default();
        }

        if !default_pool.is_empty() && !built.contains_key(&default_pool) {
            return Err(BackupError::InvalidConfig(format!(
                "default storage pool {default_pool:?} does not exist"
            )));
        }

        Ok(Self {
            pools: built,
            default_pool,
        })
    }

    /// Resolves a pool name to its sink; an empty name selects the default
    /// pool.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Storage>> {
        if name.is_empty() {
            return self.default();
        }

        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| BackupError::UnknownPool(name.to_string()))
    }

    fn default(&self) -> Result<Arc<dyn Storage>> {
        if self.default_pool.is_empty() {
            return Err(BackupError::NoDefaultPool);
        }
        self.resolve(&self.default_pool)
    }

    /// All configured pool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

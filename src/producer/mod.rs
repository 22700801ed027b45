//! Backup producers.
//!
//! A producer knows how to create and consume one flavor of backup stream:
//! database dumps (postgres, mysql) or volume archives. All producers emit
//! zstd-compressed tar archives; the artifact is fully buffered before it is
//! handed to the storage sink.

pub mod mysql;
pub mod postgres;
pub mod volume;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::docker::{ContainerInfo, ContainerRuntime};
use crate::error::BackupError;
use crate::Result;

pub(crate) const ZSTD_LEVEL: i32 = 3;

/// One backup flavor. Implementations must observe cancellation at their I/O
/// boundaries and must not leave a partially written artifact looking
/// complete: on failure the output buffer is discarded by the caller.
#[async_trait]
pub trait BackupProducer: Send + Sync {
    /// Type identifier referenced by the `type` label, e.g. `"postgres"`.
    fn name(&self) -> &'static str;

    /// File-extension suffix for artifact keys, e.g. `".tar.zst"`.
    fn extension(&self) -> &'static str;

    /// Checked before every run; reports a specific reason when the
    /// container cannot be backed up (e.g. missing credential environment).
    fn validate(&self, container: &ContainerInfo) -> Result<()>;

    /// Produces the backup stream into `out`.
    async fn backup(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// Consumes a stream previously produced by `backup`.
    async fn restore(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        data: Bytes,
    ) -> Result<()>;
}

/// Explicit producer table, built once at process start and injected into
/// the coordinator.
pub struct ProducerRegistry {
    producers: HashMap<&'static str, Arc<dyn BackupProducer>>,
}

impl ProducerRegistry {
    /// Registry with all built-in producers.
    pub fn builtin() -> Self {
        Self::with(vec![
            Arc::new(postgres::PostgresProducer),
            Arc::new(mysql::MysqlProducer),
            Arc::new(volume::VolumeProducer),
        ])
    }

    pub fn with(producers: Vec<Arc<dyn BackupProducer>>) -> Self {
        let producers = producers.into_iter().map(|p| (p.name(), p)).collect();
        Self { producers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackupProducer>> {
        self.producers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.producers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Packs spooled SQL dumps into a zstd-compressed tar archive, one
/// `<database>.sql` entry per database.
pub(crate) fn pack_sql_dumps(dumps: Vec<(String, NamedTempFile)>) -> Result<Vec<u8>> {
    let encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);

    for (database, spool) in dumps {
        let mut file = spool.reopen()?;
        let size = file.metadata()?.len();

        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);

        builder.append_data(&mut header, format!("{database}.sql"), &mut file)?;
    }

    let data = builder.into_inner()?.finish()?;
    Ok(data)
}

/// Inverse of [`pack_sql_dumps`]: yields `(database, sql)` pairs.
pub(crate) fn unpack_sql_dumps(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|err| BackupError::Producer(format!("invalid zstd stream: {err}")))?;
    let mut archive = tar::Archive::new(decoder);

    let mut dumps = Vec::new();
    for entry in archive
        .entries()
        .map_err(|err| BackupError::Producer(format!("invalid tar stream: {err}")))?
    {
        let mut entry =
            entry.map_err(|err| BackupError::Producer(format!("invalid tar entry: {err}")))?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map_err(|err| BackupError::Producer(format!("invalid tar entry path: {err}")))?
            .to_string_lossy()
            .into_owned();
        let database = name.strip_suffix(".sql").unwrap_or(&name).to_string();

        let mut sql = Vec::new();
        entry.read_to_end(&mut sql)?;
        dumps.push((database, sql));
    }

    Ok(dumps)
}

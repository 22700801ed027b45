//! PostgreSQL producer.
//!
//! Enumerates non-template databases with `psql`, dumps each one with
//! `pg_dump --clean --if-exists --create`, and packages the dumps as a
//! zstd-compressed tar archive. Restore pipes each dump back into `psql`
//! connected to the administrative `postgres` database so the contained
//! `CREATE/DROP DATABASE` statements recreate state.

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use super::{pack_sql_dumps, unpack_sql_dumps, BackupProducer};
use crate::docker::{ContainerInfo, ContainerRuntime};
use crate::error::BackupError;
use crate::Result;

pub const ENV_POSTGRES_USER: &str = "POSTGRES_USER";
pub const ENV_PG_USER: &str = "PGUSER";

pub struct PostgresProducer;

impl PostgresProducer {
    fn admin_user(container: &ContainerInfo) -> String {
        container
            .env
            .get(ENV_POSTGRES_USER)
            .or_else(|| container.env.get(ENV_PG_USER))
            .cloned()
            .unwrap_or_default()
    }

    async fn list_databases(
        &self,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        user: &str,
    ) -> Result<Vec<String>> {
        let cmd = vec![
            "psql".to_string(),
            "-U".to_string(),
            user.to_string(),
            "-d".to_string(),
            "postgres".to_string(),
            "-t".to_string(),
            "-A".to_string(),
            "-c".to_string(),
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datname != 'postgres'"
                .to_string(),
        ];

        let result = runtime.exec(&container.id, cmd, None).await?;
        if result.exit_code != 0 {
            return Err(BackupError::Producer(format!(
                "psql exited with code {}: {}",
                result.exit_code,
                result.output.trim()
            )));
        }

        Ok(result
            .output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn dump_database(
        &self,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        user: &str,
        database: &str,
    ) -> Result<NamedTempFile> {
        let cmd = vec![
            "pg_dump".to_string(),
            "-U".to_string(),
            user.to_string(),
            "-d".to_string(),
            database.to_string(),
            "--clean".to_string(),
            "--if-exists".to_string(),
            "--create".to_string(),
        ];

        // Spool to a temp file so the tar header can carry the dump size.
        let spool = NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(spool.path()).await?;

        let exit_code = runtime.exec_streamed(&container.id, cmd, &mut file).await?;
        if exit_code != 0 {
            return Err(BackupError::Producer(format!(
                "pg_dump exited with code {exit_code} for database {database:?}"
            )));
        }

        Ok(spool)
    }
}

#[async_trait]
impl BackupProducer for PostgresProducer {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn extension(&self) -> &'static str {
        ".tar.zst"
    }

    fn validate(&self, container: &ContainerInfo) -> Result<()> {
        if Self::admin_user(container).is_empty() {
            return Err(BackupError::InvalidContainer(format!(
                "container {} is missing a PostgreSQL user (set {ENV_POSTGRES_USER} or {ENV_PG_USER})",
                container.name
            )));
        }
        Ok(())
    }

    async fn backup(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let user = Self::admin_user(container);
        let databases = self.list_databases(container, runtime, &user).await?;

        let mut dumps = Vec::with_capacity(databases.len());
        for database in databases {
            if token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let spool = self.dump_database(container, runtime, &user, &database).await?;
            dumps.push((database, spool));
        }

        let archive = tokio::task::spawn_blocking(move || pack_sql_dumps(dumps))
            .await
            .map_err(|err| BackupError::Producer(err.to_string()))??;

        *out = archive;
        Ok(())
    }

    async fn restore(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        data: Bytes,
    ) -> Result<()> {
        let user = Self::admin_user(container);

        let dumps = tokio::task::spawn_blocking(move || unpack_sql_dumps(&data))
            .await
            .map_err(|err| BackupError::Producer(err.to_string()))??;

        for (database, sql) in dumps {
            if token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            // The dump carries CREATE/DROP DATABASE, so connect to the
            // administrative database.
            let cmd = vec![
                "psql".to_string(),
                "-U".to_string(),
                user.clone(),
                "-d".to_string(),
                "postgres".to_string(),
            ];

            let result = runtime
                .exec(&container.id, cmd, Some(Bytes::from(sql)))
                .await?;
            if result.exit_code != 0 {
                return Err(BackupError::Producer(format!(
                    "restore of database {database:?} exited with code {}: {}",
                    result.exit_code,
                    result.output.trim()
                )));
            }
        }

        Ok(())
    }
}

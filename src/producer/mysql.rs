//! MySQL/MariaDB producer.
//!
//! Same archive shape as the postgres producer: one `<database>.sql` tar
//! entry per non-system database, zstd-compressed. MariaDB 11 dropped the
//! `mysql`/`mysqldump` compatibility names, so the client and dump tool are
//! probed inside the container before use.

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use super::{pack_sql_dumps, unpack_sql_dumps, BackupProducer};
use crate::docker::{ContainerInfo, ContainerRuntime};
use crate::error::BackupError;
use crate::Result;

pub const ENV_MYSQL_USER: &str = "MYSQL_USER";
pub const ENV_MYSQL_PASSWORD: &str = "MYSQL_PASSWORD";
pub const ENV_MYSQL_ROOT_PASSWORD: &str = "MYSQL_ROOT_PASSWORD";

const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

pub struct MysqlProducer;

impl MysqlProducer {
    /// Root credentials win when a root password is set.
    fn credentials(container: &ContainerInfo) -> (String, String) {
        if let Some(root_password) = container.env.get(ENV_MYSQL_ROOT_PASSWORD) {
            return ("root".to_string(), root_password.clone());
        }

        (
            container
                .env
                .get(ENV_MYSQL_USER)
                .cloned()
                .unwrap_or_default(),
            container
                .env
                .get(ENV_MYSQL_PASSWORD)
                .cloned()
                .unwrap_or_default(),
        )
    }

    async fn client_command(&self, container: &ContainerInfo, runtime: &dyn ContainerRuntime) -> String {
        probe_command(container, runtime, "mariadb", "mysql").await
    }

    async fn dump_command(&self, container: &ContainerInfo, runtime: &dyn ContainerRuntime) -> String {
        probe_command(container, runtime, "mariadb-dump", "mysqldump").await
    }

    async fn list_databases(
        &self,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        client: &str,
        user: &str,
        password: &str,
    ) -> Result<Vec<String>> {
        let cmd = vec![
            client.to_string(),
            "-u".to_string(),
            user.to_string(),
            format!("-p{password}"),
            "-N".to_string(),
            "-e".to_string(),
            "SELECT schema_name FROM information_schema.schemata".to_string(),
        ];

        let result = runtime.exec(&container.id, cmd, None).await?;
        if result.exit_code != 0 {
            return Err(BackupError::Producer(format!(
                "{client} exited with code {}: {}",
                result.exit_code,
                result.output.trim()
            )));
        }

        Ok(result
            .output
            .lines()
            .map(str::trim)
            .filter(|line| {
                // Drop system databases and client warning chatter.
                !line.is_empty()
                    && !SYSTEM_DATABASES.contains(line)
                    && !line.starts_with('[')
                    && !line.contains("Warning")
            })
            .map(str::to_string)
            .collect())
    }

    async fn dump_database(
        &self,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        dump_tool: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<NamedTempFile> {
        let cmd = vec![
            dump_tool.to_string(),
            "-u".to_string(),
            user.to_string(),
            format!("-p{password}"),
            "--single-transaction".to_string(),
            "--routines".to_string(),
            "--triggers".to_string(),
            "--events".to_string(),
            "--add-drop-database".to_string(),
            "--databases".to_string(),
            database.to_string(),
        ];

        let spool = NamedTempFile::new()?;
        let mut file = tokio::fs::File::create(spool.path()).await?;

        let exit_code = runtime.exec_streamed(&container.id, cmd, &mut file).await?;
        if exit_code != 0 {
            return Err(BackupError::Producer(format!(
                "{dump_tool} exited with code {exit_code} for database {database:?}"
            )));
        }

        Ok(spool)
    }
}

/// Returns `preferred` when it exists inside the container, else `fallback`.
async fn probe_command(
    container: &ContainerInfo,
    runtime: &dyn ContainerRuntime,
    preferred: &str,
    fallback: &str,
) -> String {
    let cmd = vec!["which".to_string(), preferred.to_string()];
    match runtime.exec(&container.id, cmd, None).await {
        Ok(result) if result.exit_code == 0 => preferred.to_string(),
        _ => fallback.to_string(),
    }
}

#[async_trait]
impl BackupProducer for MysqlProducer {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn extension(&self) -> &'static str {
        ".tar.zst"
    }

    fn validate(&self, container: &ContainerInfo) -> Result<()> {
        if container.env.contains_key(ENV_MYSQL_ROOT_PASSWORD) {
            return Ok(());
        }
        if !container.env.contains_key(ENV_MYSQL_PASSWORD) {
            return Err(BackupError::InvalidContainer(format!(
                "container {} is missing a MySQL password (set {ENV_MYSQL_ROOT_PASSWORD} or {ENV_MYSQL_PASSWORD})",
                container.name
            )));
        }
        if !container.env.contains_key(ENV_MYSQL_USER) {
            return Err(BackupError::InvalidContainer(format!(
                "container {} has {ENV_MYSQL_PASSWORD} but is missing {ENV_MYSQL_USER}",
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
        let (user, password) = Self::credentials(container);
        let client = self.client_command(container, runtime).await;
        let dump_tool = self.dump_command(container, runtime).await;

        let databases = self
            .list_databases(container, runtime, &client, &user, &password)
            .await?;

        let mut dumps = Vec::with_capacity(databases.len());
        for database in databases {
            if token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let spool = self
                .dump_database(container, runtime, &dump_tool, &user, &password, &database)
                .await?;
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
        let (user, password) = Self::credentials(container);
        let client = self.client_command(container, runtime).await;

        let dumps = tokio::task::spawn_blocking(move || unpack_sql_dumps(&data))
            .await
            .map_err(|err| BackupError::Producer(err.to_string()))??;

        for (database, sql) in dumps {
            if token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let cmd = vec![
                client.clone(),
                "-u".to_string(),
                user.clone(),
                format!("-p{password}"),
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

//! The coordination hub.
//!
//! Owns the live `container id → plan` map, reconciles it against the
//! scheduler as containers come and go, runs backup and restore jobs, and
//! backs the control-plane API. All mutation funnels through the event loop
//! fed by the docker watcher plus synchronous RPC calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::docker::{ContainerEvent, ContainerRuntime};
use crate::error::BackupError;
use crate::labels::{parse_labels, BackupConfig, ContainerPlan};
use crate::notify::{Event, EventType, Fanout};
use crate::producer::ProducerRegistry;
use crate::retention;
use crate::scheduler::Scheduler;
use crate::storage::{BackupFile, PoolManager};
use crate::Result;

/// Scheduler identity of one backup configuration.
pub fn job_key(container_id: &str, config_name: &str) -> String {
    format!("{container_id}:{config_name}")
}

/// Artifact key: `{container}/{config}/{YYYY-MM-DD}/{HHMMSS}{ext}`.
pub fn artifact_key(
    container_name: &str,
    config_name: &str,
    extension: &str,
    at: DateTime<Local>,
) -> String {
    format!(
        "{}/{}/{}/{}{}",
        container_name,
        config_name,
        at.format("%Y-%m-%d"),
        at.format("%H%M%S"),
        extension
    )
}

/// Plan equality as the scheduler sees it: same names with the same
/// (type, schedule, retention, pool) tuples. Notifier lists deliberately do
/// not participate; changing them must not reschedule jobs.
pub fn plans_equal(a: &[BackupConfig], b: &[BackupConfig]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.name == y.name
                && x.backup_type == y.backup_type
                && x.schedule == y.schedule
                && x.retention == y.retention
                && x.storage == y.storage
        })
}

/// Per-config notifiers override the container-level set.
fn notify_providers<'a>(plan: &'a ContainerPlan, backup: &'a BackupConfig) -> &'a [String] {
    if !backup.notify.is_empty() {
        &backup.notify
    } else {
        &plan.notify
    }
}

/// Resolves the backup config an artifact key belongs to. The key's second
/// segment is matched against config names; keys written by older versions
/// used the backup type there, and keys with neither fall back to the first
/// config.
fn config_for_key<'a>(plan: &'a ContainerPlan, key: &str) -> Option<&'a BackupConfig> {
    let second = key.split('/').nth(1);

    match second {
        Some(segment) => plan
            .backups
            .iter()
            .find(|b| b.name == segment)
            .or_else(|| plan.backups.iter().find(|b| b.backup_type == segment))
            .or_else(|| plan.backups.first()),
        None => plan.backups.first(),
    }
}

/// A scheduler entry as reported to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_key: String,
    pub next_run: Option<DateTime<Utc>>,
}

pub struct Coordinator {
    runtime: Arc<dyn ContainerRuntime>,
    pools: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    producers: Arc<ProducerRegistry>,
    fanout: Arc<Fanout>,
    plans: RwLock<HashMap<String, ContainerPlan>>,
    token: CancellationToken,
}

impl Coordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        pools: Arc<PoolManager>,
        scheduler: Arc<Scheduler>,
        producers: Arc<ProducerRegistry>,
        fanout: Arc<Fanout>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            pools,
            scheduler,
            producers,
            fanout,
            plans: RwLock::new(HashMap::new()),
            token,
        })
    }

    /// One full fleet scan; run once at startup before the event loop takes
    /// over.
    pub async fn initial_sync(self: &Arc<Self>) -> Result<()> {
        self.sync_containers().await
    }

    /// Event loop: consumes watcher events until shutdown.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ContainerEvent>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ContainerEvent) {
        match event {
            ContainerEvent::Started(container_id) => self.add_container(&container_id).await,
            ContainerEvent::Stopped(container_id) => self.remove_container(&container_id).await,
            ContainerEvent::Sync => {
                if let Err(err) = self.sync_containers().await {
                    error!(error = %err, "container sync failed");
                }
            }
        }
    }

    async fn add_container(self: &Arc<Self>, container_id: &str) {
        let container = match self.runtime.inspect(container_id).await {
            Ok(c) => c,
            Err(err) => {
                warn!(container_id, error = %err, "failed to inspect started container");
                return;
            }
        };

        let plan = match parse_labels(&container.id, &container.name, &container.labels) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(container = %container.name, error = %err, "failed to parse container labels");
                return;
            }
        };

        if !plan.enabled {
            self.drop_plan(container_id).await;
            return;
        }

        // No-op when nothing the scheduler cares about changed.
        {
            let plans = self.plans.read().await;
            if let Some(existing) = plans.get(container_id) {
                if plans_equal(&existing.backups, &plan.backups) {
                    return;
                }
            }
        }

        self.schedule_container(plan).await;
    }

    async fn remove_container(&self, container_id: &str) {
        if self.drop_plan(container_id).await {
            info!(container_id, "removed backup schedule");
        }
    }

    /// Removes a container's plan and all of its scheduled jobs. Returns
    /// whether anything was tracked.
    async fn drop_plan(&self, container_id: &str) -> bool {
        let removed = self.plans.write().await.remove(container_id);
        match removed {
            Some(plan) => {
                for backup in &plan.backups {
                    self.scheduler
                        .remove(&job_key(container_id, &backup.name))
                        .await;
                }
                true
            }
            None => false,
        }
    }

    /// Full reconciliation against the fleet reported by the runtime.
    async fn sync_containers(self: &Arc<Self>) -> Result<()> {
        let containers = self.runtime.list_containers().await?;

        let mut seen = HashSet::new();
        for container in &containers {
            seen.insert(container.id.clone());

            let plan = match parse_labels(&container.id, &container.name, &container.labels) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(container = %container.name, error = %err, "failed to parse container labels");
                    self.drop_plan(&container.id).await;
                    continue;
                }
            };

            if !plan.enabled {
                self.drop_plan(&container.id).await;
                continue;
            }

            {
                let plans = self.plans.read().await;
                if let Some(existing) = plans.get(&container.id) {
                    if plans_equal(&existing.backups, &plan.backups) {
                        continue;
                    }
                }
            }

            self.schedule_container(plan).await;
        }

        // Containers the runtime no longer reports lose their jobs.
        let stale: Vec<String> = {
            let plans = self.plans.read().await;
            plans
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect()
        };
        for container_id in stale {
            if self.drop_plan(&container_id).await {
                info!(container_id, "removed backup schedule for vanished container");
            }
        }

        let (tracked, configs) = {
            let plans = self.plans.read().await;
            (
                plans.len(),
                plans.values().map(|p| p.backups.len()).sum::<usize>(),
            )
        };
        info!(
            total_containers = containers.len(),
            backup_enabled = tracked,
            backup_configs = configs,
            "container sync complete"
        );

        Ok(())
    }

    /// Replaces a container's plan: previous jobs are removed, then every
    /// config of the new plan is scheduled.
    async fn schedule_container(self: &Arc<Self>, plan: ContainerPlan) {
        let container_id = plan.container_id.clone();

        let previous = self
            .plans
            .write()
            .await
            .insert(container_id.clone(), plan.clone());

        if let Some(previous) = previous {
            for backup in &previous.backups {
                self.scheduler
                    .remove(&job_key(&container_id, &backup.name))
                    .await;
            }
        }

        for backup in &plan.backups {
            self.schedule_backup_config(&plan, backup).await;
        }
    }

    /// Schedules a single config. An unresolved producer or pool skips just
    /// this config; siblings still schedule.
    async fn schedule_backup_config(self: &Arc<Self>, plan: &ContainerPlan, backup: &BackupConfig) {
        if self.producers.get(&backup.backup_type).is_none() {
            error!(
                container = %plan.container_name,
                config = %backup.name,
                backup_type = %backup.backup_type,
                available = ?self.producers.names(),
                "unknown backup type"
            );
            return;
        }

        if let Err(err) = self.pools.resolve(&backup.storage) {
            error!(
                container = %plan.container_name,
                config = %backup.name,
                storage = %backup.storage,
                error = %err,
                "storage pool not found"
            );
            return;
        }

        let key = job_key(&plan.container_id, &backup.name);
        let coordinator = self.clone();
        let container_id = plan.container_id.clone();
        let config = backup.clone();

        let result = self
            .scheduler
            .add(&key, &backup.schedule, move || {
                let coordinator = coordinator.clone();
                let container_id = container_id.clone();
                let config = config.clone();
                Box::pin(async move {
                    coordinator.run_scheduled(&container_id, &config).await;
                })
            })
            .await;

        match result {
            Ok(()) => info!(
                container = %plan.container_name,
                config = %backup.name,
                backup_type = %backup.backup_type,
                schedule = %backup.schedule,
                retention = backup.retention,
                storage = %backup.storage,
                "scheduled backup"
            ),
            Err(err) => error!(
                container = %plan.container_name,
                config = %backup.name,
                schedule = %backup.schedule,
                error = %err,
                "failed to schedule backup"
            ),
        }
    }

    /// Cron entry point for one config.
    async fn run_scheduled(&self, container_id: &str, backup: &BackupConfig) {
        let plan = self.plans.read().await.get(container_id).cloned();
        let Some(plan) = plan else {
            // The container went away between the fire time and now.
            return;
        };

        match self.run_backup(&plan, backup).await {
            Ok(()) => {}
            // A stopped container is an expected skip for scheduled runs.
            Err(BackupError::NotRunning(_)) => {}
            Err(err) => error!(
                container = %plan.container_name,
                config = %backup.name,
                error = %err,
                "scheduled backup failed"
            ),
        }
    }

    /// Runs one backup: validate, produce, store, notify, enforce retention.
    async fn run_backup(&self, plan: &ContainerPlan, backup: &BackupConfig) -> Result<()> {
        let started = Instant::now();
        let providers = notify_providers(plan, backup);

        info!(
            container = %plan.container_name,
            config = %backup.name,
            backup_type = %backup.backup_type,
            "starting backup"
        );

        let producer = self
            .producers
            .get(&backup.backup_type)
            .ok_or_else(|| BackupError::UnknownType(backup.backup_type.clone()))?;

        let fail =
            |err: &BackupError, key: Option<&str>| {
                let mut event = Event::new(
                    EventType::BackupFailed,
                    &plan.container_name,
                    &backup.backup_type,
                )
                .with_error(err);
                if let Some(key) = key {
                    event = event.with_key(key);
                }
                self.fanout.notify(event, providers);
            };

        let container = match self.runtime.inspect(&plan.container_id).await {
            Ok(container) => container,
            Err(err) => {
                let err = BackupError::from(err);
                error!(container = %plan.container_name, error = %err, "failed to inspect container for backup");
                fail(&err, None);
                return Err(err);
            }
        };

        if !container.running {
            warn!(container = %plan.container_name, "container not running, skipping backup");
            return Err(BackupError::NotRunning(plan.container_name.clone()));
        }

        if let Err(err) = producer.validate(&container) {
            error!(container = %plan.container_name, error = %err, "container validation failed");
            fail(&err, None);
            return Err(err);
        }

        let store = match self.pools.resolve(&backup.storage) {
            Ok(store) => store,
            Err(err) => {
                error!(container = %plan.container_name, error = %err, "failed to resolve storage pool");
                fail(&err, None);
                return Err(err);
            }
        };

        let key = artifact_key(
            &plan.container_name,
            &backup.name,
            producer.extension(),
            Local::now(),
        );

        let mut buffer = Vec::new();
        if let Err(err) = producer
            .backup(&self.token, &container, self.runtime.as_ref(), &mut buffer)
            .await
        {
            error!(container = %plan.container_name, error = %err, "backup failed");
            fail(&err, Some(&key));
            return Err(err);
        }

        let size = buffer.len() as u64;
        if let Err(err) = store.put(&key, Bytes::from(buffer)).await {
            error!(container = %plan.container_name, key = %key, error = %err, "failed to store backup");
            fail(&err, Some(&key));
            return Err(err);
        }

        let duration = started.elapsed();
        info!(
            container = %plan.container_name,
            config = %backup.name,
            key = %key,
            size,
            ?duration,
            "backup completed"
        );

        self.fanout.notify(
            Event::new(
                EventType::BackupCompleted,
                &plan.container_name,
                &backup.backup_type,
            )
            .with_key(&key)
            .with_size(size)
            .with_duration(duration),
            providers,
        );

        let prefix = format!("{}/{}/", plan.container_name, backup.name);
        let (deleted, err) = retention::enforce(&store, &prefix, backup.retention as usize).await;
        if let Some(err) = err {
            warn!(container = %plan.container_name, error = %err, "retention enforcement failed");
        } else if deleted > 0 {
            info!(
                container = %plan.container_name,
                config = %backup.name,
                deleted,
                "retention policy applied"
            );
        }

        Ok(())
    }

    /// Looks a container up by name: tracked plans first, then a live scan
    /// for containers the daemon is not tracking (e.g. disabled ones being
    /// triggered explicitly).
    async fn find_plan(&self, container_name: &str) -> Result<ContainerPlan> {
        {
            let plans = self.plans.read().await;
            if let Some(plan) = plans.values().find(|p| p.container_name == container_name) {
                return Ok(plan.clone());
            }
        }

        for container in self.runtime.list_containers().await? {
            if container.name == container_name {
                return Ok(parse_labels(
                    &container.id,
                    &container.name,
                    &container.labels,
                )?);
            }
        }

        Err(BackupError::ContainerNotFound(container_name.to_string()))
    }

    fn find_config<'a>(
        plan: &'a ContainerPlan,
        config_name: &str,
    ) -> Result<&'a BackupConfig> {
        plan.backups
            .iter()
            .find(|b| b.name == config_name)
            .ok_or_else(|| {
                BackupError::NotFound(format!(
                    "backup config {:?} in container {:?}",
                    config_name, plan.container_name
                ))
            })
    }

    /// Immediate backup trigger from the control plane. Runs one named
    /// config, or every config of the plan.
    pub async fn trigger_backup(&self, container_name: &str, config_name: Option<&str>) -> Result<()> {
        let plan = self.find_plan(container_name).await?;

        if !plan.enabled {
            return Err(BackupError::InvalidConfig(format!(
                "container {container_name:?} does not have backup enabled"
            )));
        }

        let configs: Vec<BackupConfig> = match config_name {
            Some(name) if !name.is_empty() => vec![Self::find_config(&plan, name)?.clone()],
            _ => plan.backups.clone(),
        };

        for backup in &configs {
            self.run_backup(&plan, backup).await?;
        }

        Ok(())
    }

    /// Aggregated listing across every pool the plan references.
    pub async fn list_backups(&self, container_name: &str) -> Result<Vec<BackupFile>> {
        let plan = self.find_plan(container_name).await?;

        let mut all = Vec::new();
        let mut seen_pools = HashSet::new();

        for backup in &plan.backups {
            if !seen_pools.insert(backup.storage.clone()) {
                continue;
            }

            let store = match self.pools.resolve(&backup.storage) {
                Ok(store) => store,
                Err(err) => {
                    warn!(pool = %backup.storage, error = %err, "failed to resolve storage pool");
                    continue;
                }
            };

            match store.list(&format!("{container_name}/")).await {
                Ok(files) => all.extend(files),
                Err(err) => {
                    warn!(pool = %backup.storage, error = %err, "failed to list backups");
                }
            }
        }

        all.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(all)
    }

    /// Deletes one artifact, resolving its pool from the key.
    pub async fn delete_backup(&self, container_name: &str, key: &str) -> Result<()> {
        let plan = self.find_plan(container_name).await?;

        let backup = config_for_key(&plan, key).ok_or_else(|| {
            BackupError::NotFound(format!("no backup configuration for key {key:?}"))
        })?;

        let store = self.pools.resolve(&backup.storage)?;
        store.delete(key).await?;

        info!(container = %container_name, key = %key, "backup deleted");
        Ok(())
    }

    /// Restores one artifact into its container.
    pub async fn restore_backup(&self, container_name: &str, key: &str) -> Result<()> {
        let plan = self.find_plan(container_name).await?;

        let backup = config_for_key(&plan, key)
            .ok_or_else(|| {
                BackupError::NotFound(format!("no backup configuration for key {key:?}"))
            })?
            .clone();
        let providers = notify_providers(&plan, &backup);

        let producer = self
            .producers
            .get(&backup.backup_type)
            .ok_or_else(|| BackupError::UnknownType(backup.backup_type.clone()))?;
        let store = self.pools.resolve(&backup.storage)?;

        let fail = |err: &BackupError| {
            self.fanout.notify(
                Event::new(
                    EventType::RestoreFailed,
                    &plan.container_name,
                    &backup.backup_type,
                )
                .with_key(key)
                .with_error(err),
                providers,
            );
        };

        let container = self.runtime.inspect(&plan.container_id).await?;
        if !container.running {
            return Err(BackupError::NotRunning(container_name.to_string()));
        }

        if let Err(err) = producer.validate(&container) {
            fail(&err);
            return Err(err);
        }

        let started = Instant::now();
        info!(container = %container_name, key = %key, "starting restore");
        self.fanout.notify(
            Event::new(
                EventType::RestoreStarted,
                &plan.container_name,
                &backup.backup_type,
            )
            .with_key(key),
            providers,
        );

        let data = match store.get(key).await {
            Ok(data) => data,
            Err(err) => {
                fail(&err);
                return Err(err);
            }
        };

        if let Err(err) = producer
            .restore(&self.token, &container, self.runtime.as_ref(), data)
            .await
        {
            error!(container = %container_name, key = %key, error = %err, "restore failed");
            fail(&err);
            return Err(err);
        }

        let duration = started.elapsed();
        info!(container = %container_name, key = %key, ?duration, "restore completed");
        self.fanout.notify(
            Event::new(
                EventType::RestoreCompleted,
                &plan.container_name,
                &backup.backup_type,
            )
            .with_key(key)
            .with_duration(duration),
            providers,
        );

        Ok(())
    }

    /// Read-only view of every tracked plan, sorted by container name.
    pub async fn containers(&self) -> Vec<ContainerPlan> {
        let mut plans: Vec<ContainerPlan> = self.plans.read().await.values().cloned().collect();
        plans.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        plans
    }

    /// Read-only view of the scheduler, sorted by job key.
    pub async fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .scheduler
            .list()
            .await
            .into_iter()
            .map(|(job_key, next_run)| ScheduledJob { job_key, next_run })
            .collect();
        jobs.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(name: &str, schedule: &str, retention: u32, storage: &str) -> BackupConfig {
        BackupConfig {
            name: name.to_string(),
            backup_type: "postgres".to_string(),
            schedule: schedule.to_string(),
            retention,
            storage: storage.to_string(),
            notify: Vec::new(),
        }
    }

    fn plan(configs: Vec<BackupConfig>) -> ContainerPlan {
        ContainerPlan {
            container_id: "abc123".to_string(),
            container_name: "shop".to_string(),
            enabled: true,
            notify: vec!["ops".to_string()],
            backups: configs,
        }
    }

    #[test]
    fn job_key_format() {
        assert_eq!(job_key("abc123", "db"), "abc123:db");
    }

    #[test]
    fn artifact_key_format() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 4, 5, 6).unwrap();
        assert_eq!(
            artifact_key("shop", "db", ".tar.zst", at),
            "shop/db/2024-03-07/040506.tar.zst"
        );
    }

    #[test]
    fn artifact_keys_differ_per_second() {
        let first = Local.with_ymd_and_hms(2024, 3, 7, 4, 5, 6).unwrap();
        let second = Local.with_ymd_and_hms(2024, 3, 7, 4, 5, 7).unwrap();
        assert_ne!(
            artifact_key("shop", "db", ".tar.zst", first),
            artifact_key("shop", "db", ".tar.zst", second)
        );
    }

    #[test]
    fn plan_equality_ignores_notify() {
        let a = vec![config("db", "0 3 * * *", 7, "")];
        let mut b = a.clone();
        b[0].notify = vec!["ops".to_string()];
        assert!(plans_equal(&a, &b));
    }

    #[test]
    fn plan_equality_detects_schedule_change() {
        let a = vec![config("db", "0 3 * * *", 7, "")];
        let b = vec![config("db", "*/5 * * * *", 7, "")];
        assert!(!plans_equal(&a, &b));
    }

    #[test]
    fn plan_equality_detects_membership_change() {
        let a = vec![config("db", "0 3 * * *", 7, "")];
        let b = vec![
            config("db", "0 3 * * *", 7, ""),
            config("files", "0 4 * * *", 7, ""),
        ];
        assert!(!plans_equal(&a, &b));

        let c = vec![config("db", "0 3 * * *", 3, "")];
        assert!(!plans_equal(&a, &c));
    }

    #[test]
    fn config_for_key_matches_config_name() {
        let p = plan(vec![
            config("db", "0 3 * * *", 7, "fast"),
            config("files", "0 4 * * *", 7, "slow"),
        ]);

        let found = config_for_key(&p, "shop/files/2024-01-01/120000.tar.zst").unwrap();
        assert_eq!(found.name, "files");
    }

    #[test]
    fn config_for_key_falls_back_to_backup_type() {
        // Old keys carried the backup type as their second segment.
        let p = plan(vec![config("db", "0 3 * * *", 7, "fast")]);

        let found = config_for_key(&p, "shop/postgres/2024-01-01/120000.tar.zst").unwrap();
        assert_eq!(found.name, "db");
    }

    #[test]
    fn config_for_key_falls_back_to_first_config() {
        let p = plan(vec![
            config("db", "0 3 * * *", 7, "fast"),
            config("files", "0 4 * * *", 7, "slow"),
        ]);

        let found = config_for_key(&p, "shop/unknown/2024-01-01/120000.tar.zst").unwrap();
        assert_eq!(found.name, "db");

        assert!(config_for_key(&plan(vec![]), "shop/db/x").is_none());
    }

    mod reconciliation {
        use super::*;
        use crate::config::StoragePool;
        use crate::docker::{ContainerInfo, ContainerRuntime, ExecOutput};
        use crate::producer::ProducerRegistry;
        use crate::scheduler::Scheduler;
        use crate::storage::PoolManager;
        use async_trait::async_trait;
        use bytes::Bytes;
        use std::sync::Mutex;
        use tempfile::TempDir;
        use tokio::io::{AsyncWrite, AsyncWriteExt};

        /// Scripted runtime: the fleet is plain data the test mutates, and
        /// exec answers psql/pg_dump with canned output.
        struct FakeRuntime {
            containers: Mutex<Vec<ContainerInfo>>,
            exec_stdin: Mutex<Vec<(Vec<String>, Option<Bytes>)>>,
        }

        impl FakeRuntime {
            fn new(containers: Vec<ContainerInfo>) -> Arc<Self> {
                Arc::new(Self {
                    containers: Mutex::new(containers),
                    exec_stdin: Mutex::new(Vec::new()),
                })
            }

            fn set_containers(&self, containers: Vec<ContainerInfo>) {
                *self.containers.lock().unwrap() = containers;
            }
        }

        #[async_trait]
        impl ContainerRuntime for FakeRuntime {
            async fn list_containers(&self) -> crate::Result<Vec<ContainerInfo>> {
                Ok(self
                    .containers
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|c| c.running)
                    .cloned()
                    .collect())
            }

            async fn inspect(&self, container_id: &str) -> crate::Result<ContainerInfo> {
                self.containers
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|c| c.id == container_id)
                    .cloned()
                    .ok_or_else(|| BackupError::ContainerNotFound(container_id.to_string()))
            }

            async fn containers_using_volume(
                &self,
                volume_name: &str,
            ) -> crate::Result<Vec<ContainerInfo>> {
                Ok(self
                    .containers
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|c| c.mounts.iter().any(|m| m.name == volume_name))
                    .cloned()
                    .collect())
            }

            async fn exec(
                &self,
                _container_id: &str,
                cmd: Vec<String>,
                stdin: Option<Bytes>,
            ) -> crate::Result<ExecOutput> {
                self.exec_stdin
                    .lock()
                    .unwrap()
                    .push((cmd.clone(), stdin));

                // The database listing query is the only exec whose output
                // the producer parses.
                let output = if cmd.iter().any(|a| a == "-c") {
                    "app\n".to_string()
                } else {
                    String::new()
                };
                Ok(ExecOutput {
                    exit_code: 0,
                    output,
                })
            }

            async fn exec_streamed(
                &self,
                _container_id: &str,
                cmd: Vec<String>,
                out: &mut (dyn AsyncWrite + Unpin + Send),
            ) -> crate::Result<i64> {
                if cmd.first().map(String::as_str) == Some("pg_dump") {
                    out.write_all(b"CREATE DATABASE app;\n").await?;
                }
                Ok(0)
            }

            async fn stop_container(
                &self,
                container_id: &str,
                _timeout_secs: i64,
            ) -> crate::Result<()> {
                for c in self.containers.lock().unwrap().iter_mut() {
                    if c.id == container_id {
                        c.running = false;
                    }
                }
                Ok(())
            }

            async fn start_container(&self, container_id: &str) -> crate::Result<()> {
                for c in self.containers.lock().unwrap().iter_mut() {
                    if c.id == container_id {
                        c.running = true;
                    }
                }
                Ok(())
            }
        }

        fn postgres_container(id: &str, name: &str, schedule: &str) -> ContainerInfo {
            let labels = [
                ("docker-backup.enable", "true"),
                ("docker-backup.db.type", "postgres"),
                ("docker-backup.db.schedule", schedule),
                ("docker-backup.db.retention", "2"),
            ];
            ContainerInfo {
                id: id.to_string(),
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                env: [("POSTGRES_USER".to_string(), "app".to_string())]
                    .into_iter()
                    .collect(),
                running: true,
                mounts: Vec::new(),
            }
        }

        async fn coordinator_with(
            runtime: Arc<FakeRuntime>,
            pool_dir: &TempDir,
        ) -> Arc<Coordinator> {
            let mut options = HashMap::new();
            options.insert("path".to_string(), pool_dir.path().display().to_string());
            let pools: HashMap<String, StoragePool> = [(
                "local".to_string(),
                StoragePool {
                    name: "local".to_string(),
                    pool_type: "local".to_string(),
                    options,
                },
            )]
            .into_iter()
            .collect();

            Coordinator::new(
                runtime,
                Arc::new(PoolManager::new(&pools, "").unwrap()),
                Arc::new(Scheduler::new().await.unwrap()),
                Arc::new(ProducerRegistry::builtin()),
                Arc::new(Fanout::new()),
                CancellationToken::new(),
            )
        }

        #[tokio::test]
        async fn sync_schedules_labeled_containers() {
            let runtime = FakeRuntime::new(vec![
                postgres_container("c1", "shop", "*/5 * * * *"),
                ContainerInfo {
                    id: "c2".to_string(),
                    name: "plain".to_string(),
                    labels: HashMap::new(),
                    env: HashMap::new(),
                    running: true,
                    mounts: Vec::new(),
                },
            ]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;

            coordinator.initial_sync().await.unwrap();

            assert!(coordinator.scheduler.has_job("c1:db").await);
            assert_eq!(coordinator.scheduler.job_count().await, 1);
            assert_eq!(coordinator.containers().await.len(), 1);
        }

        #[tokio::test]
        async fn unchanged_plan_is_a_noop() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;

            coordinator.initial_sync().await.unwrap();
            let before = coordinator.jobs().await;

            coordinator.initial_sync().await.unwrap();
            let after = coordinator.jobs().await;

            assert_eq!(coordinator.scheduler.job_count().await, 1);
            assert_eq!(before.len(), after.len());
            assert_eq!(before[0].job_key, after[0].job_key);
        }

        #[tokio::test]
        async fn label_change_replans_the_job() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime.clone(), &pool_dir).await;

            coordinator.initial_sync().await.unwrap();
            coordinator.scheduler.start().await.unwrap();

            runtime.set_containers(vec![postgres_container("c1", "shop", "*/5 * * * *")]);
            coordinator.initial_sync().await.unwrap();

            let jobs = coordinator.jobs().await;
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].job_key, "c1:db");

            let next = jobs[0].next_run.expect("next fire time");
            assert!((next - Utc::now()).num_seconds() <= 5 * 60);

            coordinator.scheduler.shutdown().await.unwrap();
        }

        #[tokio::test]
        async fn vanished_container_loses_its_jobs() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime.clone(), &pool_dir).await;

            coordinator.initial_sync().await.unwrap();
            assert_eq!(coordinator.scheduler.job_count().await, 1);

            runtime.set_containers(Vec::new());
            coordinator.initial_sync().await.unwrap();

            assert_eq!(coordinator.scheduler.job_count().await, 0);
            assert!(coordinator.containers().await.is_empty());
        }

        #[tokio::test]
        async fn disabled_container_is_dropped() {
            let mut container = postgres_container("c1", "shop", "0 3 * * *");
            let runtime = FakeRuntime::new(vec![container.clone()]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime.clone(), &pool_dir).await;

            coordinator.initial_sync().await.unwrap();
            assert_eq!(coordinator.scheduler.job_count().await, 1);

            container
                .labels
                .insert("docker-backup.enable".to_string(), "false".to_string());
            runtime.set_containers(vec![container]);
            coordinator.initial_sync().await.unwrap();

            assert_eq!(coordinator.scheduler.job_count().await, 0);
        }

        #[tokio::test]
        async fn unknown_backup_type_skips_only_that_config() {
            let mut container = postgres_container("c1", "shop", "0 3 * * *");
            container
                .labels
                .insert("docker-backup.weird.type".to_string(), "sqlite".to_string());
            container.labels.insert(
                "docker-backup.weird.schedule".to_string(),
                "0 4 * * *".to_string(),
            );

            let runtime = FakeRuntime::new(vec![container]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;

            coordinator.initial_sync().await.unwrap();

            assert!(coordinator.scheduler.has_job("c1:db").await);
            assert!(!coordinator.scheduler.has_job("c1:weird").await);
        }

        #[tokio::test]
        async fn trigger_writes_artifact_and_enforces_retention() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;
            coordinator.initial_sync().await.unwrap();

            // Three runs against retention=2; spaced out so every artifact
            // key gets a distinct HHMMSS second.
            for _ in 0..3 {
                coordinator.trigger_backup("shop", None).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
            }

            let backups = coordinator.list_backups("shop").await.unwrap();
            assert_eq!(backups.len(), 2);

            let mut keys: Vec<&str> = backups.iter().map(|b| b.key.as_str()).collect();
            keys.sort_unstable();
            keys.dedup();
            assert_eq!(keys.len(), 2, "artifact keys must be distinct");
            for key in keys {
                assert!(key.starts_with("shop/db/"), "unexpected key {key}");
                assert!(key.ends_with(".tar.zst"), "unexpected key {key}");
            }
        }

        #[tokio::test]
        async fn trigger_unknown_container_fails() {
            let runtime = FakeRuntime::new(Vec::new());
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;

            let err = coordinator.trigger_backup("ghost", None).await.unwrap_err();
            assert!(matches!(err, BackupError::ContainerNotFound(_)));
        }

        #[tokio::test]
        async fn restore_pipes_dump_back_into_the_container() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime.clone(), &pool_dir).await;
            coordinator.initial_sync().await.unwrap();

            coordinator.trigger_backup("shop", None).await.unwrap();
            let backups = coordinator.list_backups("shop").await.unwrap();
            let key = backups[0].key.clone();

            coordinator.restore_backup("shop", &key).await.unwrap();

            let execs = runtime.exec_stdin.lock().unwrap();
            let restored = execs
                .iter()
                .find(|(cmd, stdin)| {
                    cmd.first().map(String::as_str) == Some("psql") && stdin.is_some()
                })
                .expect("restore must pipe the dump into psql");
            assert_eq!(
                restored.1.as_deref(),
                Some(b"CREATE DATABASE app;\n".as_slice())
            );
        }

        #[tokio::test]
        async fn delete_backup_is_idempotent_through_the_coordinator() {
            let runtime = FakeRuntime::new(vec![postgres_container("c1", "shop", "0 3 * * *")]);
            let pool_dir = TempDir::new().unwrap();
            let coordinator = coordinator_with(runtime, &pool_dir).await;
            coordinator.initial_sync().await.unwrap();

            coordinator.trigger_backup("shop", None).await.unwrap();
            let key = coordinator.list_backups("shop").await.unwrap()[0].key.clone();

            coordinator.delete_backup("shop", &key).await.unwrap();
            coordinator.delete_backup("shop", &key).await.unwrap();
            assert!(coordinator.list_backups("shop").await.unwrap().is_empty());
        }
    }

    #[test]
    fn notify_override_beats_container_default() {
        let mut p = plan(vec![config("db", "0 3 * * *", 7, "")]);

        let inherited = p.backups[0].clone();
        assert_eq!(notify_providers(&p, &inherited).to_vec(), vec!["ops"]);

        p.backups[0].notify = vec!["oncall".to_string()];
        let overridden = p.backups[0].clone();
        assert_eq!(notify_providers(&p, &overridden).to_vec(), vec!["oncall"]);
    }
}

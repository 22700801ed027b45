//! Cron scheduler keyed by stable job keys.
//!
//! Wraps `tokio_cron_scheduler::JobScheduler` with a `JobKey → entry` map so
//! a key can be added, replaced atomically, and removed idempotently. Label
//! schedules use the 5-field cron dialect; 6-field and `@`-shortcut
//! expressions are rejected before they reach the underlying parser so the
//! label grammar stays stable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::BackupError;
use crate::Result;

pub struct Scheduler {
    inner: Mutex<JobScheduler>,
    jobs: Mutex<HashMap<String, Uuid>>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .map_err(|err| BackupError::Scheduler(err.to_string()))?;

        Ok(Self {
            inner: Mutex::new(inner),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Rejects anything that is not a plain 5-field cron expression.
    pub fn validate_expression(schedule: &str) -> Result<()> {
        let schedule = schedule.trim();
        if schedule.starts_with('@') || schedule.split_whitespace().count() != 5 {
            return Err(BackupError::InvalidSchedule(schedule.to_string()));
        }
        Ok(())
    }

    /// Schedules `run` under `job_key`. An existing entry for the key is
    /// removed first; an invalid schedule leaves the previous entry intact.
    pub async fn add<F>(&self, job_key: &str, schedule: &str, run: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self::validate_expression(schedule)?;

        // The underlying parser wants a seconds field; pin it to zero so the
        // label dialect stays exactly 5-field.
        let with_seconds = format!("0 {}", schedule.trim());
        let job = Job::new_async(with_seconds.as_str(), move |_uuid, _lock| run())
            .map_err(|_| BackupError::InvalidSchedule(schedule.to_string()))?;

        let mut jobs = self.jobs.lock().await;
        let scheduler = self.inner.lock().await;

        if let Some(previous) = jobs.remove(job_key) {
            let _ = scheduler.remove(&previous).await;
        }

        let id = scheduler
            .add(job)
            .await
            .map_err(|err| BackupError::Scheduler(err.to_string()))?;
        jobs.insert(job_key.to_string(), id);

        tracing::debug!(job_key, schedule, "scheduled job");
        Ok(())
    }

    /// Removes the entry for `job_key`, if any.
    pub async fn remove(&self, job_key: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(id) = jobs.remove(job_key) {
            let scheduler = self.inner.lock().await;
            let _ = scheduler.remove(&id).await;
            tracing::debug!(job_key, "removed scheduled job");
        }
    }

    pub async fn has_job(&self, job_key: &str) -> bool {
        self.jobs.lock().await.contains_key(job_key)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Snapshot of every job key with its next fire time.
    pub async fn list(&self) -> HashMap<String, Option<DateTime<Utc>>> {
        let jobs: Vec<(String, Uuid)> = self
            .jobs
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut scheduler = self.inner.lock().await;
        let mut result = HashMap::with_capacity(jobs.len());
        for (key, id) in jobs {
            let next = scheduler.next_tick_for_job(id).await.ok().flatten();
            result.insert(key, next);
        }
        result
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .start()
            .await
            .map_err(|err| BackupError::Scheduler(err.to_string()))
    }

    /// Stops the scheduler; resolves once the underlying scheduler has shut
    /// down. Jobs already dispatched keep running on their own tasks.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|err| BackupError::Scheduler(err.to_string()))
    }
}

//! Scheduler tick loop (spec.md §4.4).
//!
//! Grounded on the teacher's `SchedulerDaemon` (fixed 60s `sleep` poll over
//! a `JobStore`). `steward` keeps the load-tick-save shape but replaces the
//! fixed poll with a wake on `min(next_run_at)` across all enabled jobs, so
//! a daemon with one job due in an hour sleeps roughly an hour rather than
//! waking 60 times to find nothing due.

use crate::bus::{EventBus, Priority as BusPriority};
use crate::error::{Result, StewardError};
use crate::scheduler::model::{JobAction, MAX_JITTER_SECS, ScheduledJob};
use crate::scheduler::store::JobStore;
use crate::store::entities::{Priority as TaskPriority, Severity, Task};
use crate::store::Store;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use uuid::Uuid;

/// Ceiling on how long the daemon ever sleeps between due-checks, so a
/// newly created job (e.g. via [`SchedulerDaemon::run_now`] racing the
/// sleeping tick) is never starved for more than this long.
const MAX_SLEEP: Duration = Duration::from_secs(300);

pub struct SchedulerDaemon {
    job_store: JobStore,
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl SchedulerDaemon {
    pub fn new(job_store: JobStore, store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self {
            job_store,
            store,
            bus,
        }
    }

    /// `enabled → due → running → {succeeded|failed} → enabled|disabled`:
    /// wakes on the soonest `next_run_at` across every enabled job, ticks,
    /// then sleeps again. Runs until cancelled by the caller.
    pub async fn run_loop(&self, cancel: &tokio_util::sync::CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let sleep_for = self.sleep_until_next_due()?;
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            self.tick().await?;
        }
    }

    fn sleep_until_next_due(&self) -> Result<Duration> {
        let jobs_file = self.job_store.load_jobs().map_err(io_err)?;
        let now = Utc::now();
        let next = jobs_file
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.next_run_at)
            .min();
        Ok(match next {
            Some(next) if next > now => {
                let delta = (next - now).to_std().unwrap_or(Duration::ZERO);
                delta.min(MAX_SLEEP)
            }
            _ => Duration::from_millis(1),
        })
    }

    /// One sweep: coalesce any missed windows, run everything due, persist.
    pub async fn tick(&self) -> Result<()> {
        let mut jobs_file = self.job_store.load_jobs().map_err(io_err)?;
        let now = Utc::now();
        let mut changed = false;

        for job in jobs_file.jobs.iter_mut() {
            if !job.enabled {
                continue;
            }
            job.coalesce_missed(now);
            if !job.is_due(now) {
                continue;
            }
            changed = true;
            self.run_job(job, now).await;
        }

        if changed {
            self.job_store.save_jobs(&jobs_file).map_err(io_err)?;
        }
        Ok(())
    }

    pub fn job_store(&self) -> &JobStore {
        &self.job_store
    }

    /// spec.md §6 `jobs enable|disable`.
    pub fn set_enabled(&self, job_id: Uuid, enabled: bool) -> Result<()> {
        let mut jobs_file = self.job_store.load_jobs().map_err(io_err)?;
        let job = jobs_file
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| StewardError::NotFound {
                entity: "scheduled_job".to_string(),
                id: job_id.to_string(),
            })?;
        job.enabled = enabled;
        job.updated_at = Utc::now();
        job.version += 1;
        self.job_store.save_jobs(&jobs_file).map_err(io_err)
    }

    /// Manual trigger (spec.md §6 `jobs run`): executes a job immediately
    /// regardless of `next_run_at`, still subject to failure accounting.
    pub async fn run_now(&self, job_id: Uuid) -> Result<()> {
        let mut jobs_file = self.job_store.load_jobs().map_err(io_err)?;
        let now = Utc::now();
        let job = jobs_file
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| StewardError::NotFound {
                entity: "scheduled_job".to_string(),
                id: job_id.to_string(),
            })?;
        self.run_job(job, now).await;
        self.job_store.save_jobs(&jobs_file).map_err(io_err)?;
        Ok(())
    }

    async fn run_job(&self, job: &mut ScheduledJob, now: chrono::DateTime<Utc>) {
        let correlation_id = Uuid::new_v4();
        let tick_priority = if job.critical { BusPriority::High } else { BusPriority::Normal };
        self.store.append_event(
            "scheduler.tick",
            Severity::Normal,
            "scheduler",
            serde_json::json!({"job_id": job.id, "name": job.name, "critical": job.critical}),
            correlation_id,
        );
        let _ = self
            .bus
            .publish(
                "scheduler.tick",
                tick_priority,
                Severity::Normal,
                serde_json::json!({"job_id": job.id, "name": job.name}),
                correlation_id,
                None,
                Duration::from_millis(100),
            )
            .await;

        self.store.append_event(
            "scheduler.job.running",
            Severity::Low,
            "scheduler",
            serde_json::json!({"job_id": job.id, "name": job.name}),
            correlation_id,
        );
        let _ = self
            .bus
            .publish(
                "scheduler.job.running",
                BusPriority::Normal,
                Severity::Low,
                serde_json::json!({"job_id": job.id}),
                correlation_id,
                None,
                Duration::from_millis(100),
            )
            .await;

        let jitter: i64 = rand::thread_rng().gen_range(-MAX_JITTER_SECS..=MAX_JITTER_SECS);
        match self.execute_job(job, correlation_id).await {
            Ok(()) => {
                job.record_success(now, jitter);
                self.store.append_event(
                    "scheduler.job.succeeded",
                    Severity::Low,
                    "scheduler",
                    serde_json::json!({"job_id": job.id}),
                    correlation_id,
                );
            }
            Err(e) => {
                job.record_failure(now, jitter);
                self.store.append_event(
                    "scheduler.job.failed",
                    Severity::High,
                    "scheduler",
                    serde_json::json!({"job_id": job.id, "error": e.to_string(), "disabled": !job.enabled}),
                    correlation_id,
                );
            }
        }
    }

    async fn execute_job(&self, job: &ScheduledJob, correlation_id: Uuid) -> Result<()> {
        match &job.action {
            JobAction::Shell(shell) => {
                let mut cmd = tokio::process::Command::new(&shell.program);
                cmd.args(&shell.args);
                let timeout = Duration::from_secs(shell.timeout_secs.unwrap_or(30));
                let run = tokio::time::timeout(timeout, cmd.output());
                let output = run.await.map_err(|_| StewardError::Timeout {
                    what: format!("scheduled job {}", job.name),
                    duration: timeout,
                })??;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    return Err(StewardError::Internal {
                        message: format!("job {} exited with {}: {}", job.name, output.status, stderr),
                    });
                }
                Ok(())
            }
            JobAction::Delegate(delegate) => {
                let task = Task::new(
                    delegate.agent,
                    delegate.task_title.clone(),
                    TaskPriority::Medium,
                    "scheduled",
                    false,
                    Utc::now(),
                );
                self.store.insert_task(task);
                self.store.append_event(
                    "scheduler.job.delegated",
                    Severity::Low,
                    "scheduler",
                    serde_json::json!({"job_id": job.id, "agent": delegate.agent}),
                    correlation_id,
                );
                Ok(())
            }
        }
    }
}

fn io_err(e: anyhow::Error) -> StewardError {
    StewardError::StorageUnavailable {
        message: e.to_string(),
    }
}

//! # Migration Controller
//!
//! Plans or resumes a job, spawns the worker-process pool, then switches
//! role to monitoring until no batches remain pending or processing.
//!
//! The lifecycle is deliberately two-phase: the planning connection is
//! closed before any worker process is spawned, and each worker opens its
//! own connections after it exists. No live network handle ever crosses the
//! process-creation boundary.

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{MigratorConfig, ResumePolicy};
use crate::database::DatabaseConnection;
use crate::error::{MigratorError, Result};
use crate::models::job::{JobStatus, MigrationJob};
use crate::planner;
use crate::store::{CoordinationStore, StorePolicy};

/// Orchestrates one migration run end to end.
pub struct MigrationController {
    config: MigratorConfig,
    workers: Vec<Child>,
    workers_joined: bool,
    shutdown: watch::Receiver<bool>,
}

impl MigrationController {
    pub fn new(config: MigratorConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            workers: Vec::new(),
            workers_joined: true,
            shutdown,
        }
    }

    /// Run the full lifecycle. Worker teardown runs exactly once on every
    /// exit path.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;

        if let Err(err) = &result {
            error!(error = %err, "controller error");
        }
        if !self.workers_joined {
            self.shutdown_workers().await;
        }

        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        // Phase 1: planning. Open, plan, close before spawning anything.
        let planning = DatabaseConnection::connect(&self.config.database_url()?).await?;
        planning.health_check().await?;
        let job_id = self.get_or_create_job(&planning).await?;
        planning.close().await;

        // Phase 2: execution. Spawn workers on clean state, then reopen for
        // monitoring only.
        self.spawn_workers(job_id)?;
        let monitoring = DatabaseConnection::connect(&self.config.database_url()?).await?;
        let store = CoordinationStore::new(
            monitoring.pool().clone(),
            StorePolicy::from_config(&self.config),
        );

        let finished = self.monitor_job(&store, job_id).await;
        monitoring.close().await;

        match finished {
            Ok(true) => {
                self.join_workers().await;
                info!(%job_id, "migration complete");
                Ok(())
            }
            Ok(false) => {
                warn!(%job_id, "monitoring interrupted by shutdown");
                Err(MigratorError::Shutdown)
            }
            Err(err) => Err(err),
        }
    }

    // ---------------- Planning ----------------

    async fn get_or_create_job(&self, db: &DatabaseConnection) -> Result<Uuid> {
        let store =
            CoordinationStore::new(db.pool().clone(), StorePolicy::from_config(&self.config));

        let active = MigrationJob::active(db.pool()).await?;
        if !active.is_empty() {
            warn!(count = active.len(), "found active job(s)");
            for job in &active {
                info!(
                    job_id = %job.id,
                    status = %job.status,
                    completed_batches = job.completed_batches,
                    total_batches = job.total_batches,
                    "active job"
                );
            }

            if self.decide_resume().await? {
                let job = &active[0];
                info!(job_id = %job.id, "resuming job");

                // Recover from a prior crash before workers start claiming.
                let reclaimed = store.reset_stuck_batches(job.id).await?;
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "reset stuck batches");
                }

                MigrationJob::update_status(db.pool(), job.id, JobStatus::Running).await?;
                return Ok(job.id);
            }

            info!("resume declined, marking active jobs failed");
            for job in &active {
                MigrationJob::update_status(db.pool(), job.id, JobStatus::Failed).await?;
            }
        }

        self.create_new_job(db).await
    }

    async fn create_new_job(&self, db: &DatabaseConnection) -> Result<Uuid> {
        info!("planning new migration job");

        let job = MigrationJob::create(db.pool()).await?;
        let summary = planner::create_batches(db.pool(), job.id, self.config.batch_size).await?;

        info!(
            job_id = %job.id,
            total_records = summary.total_records,
            total_batches = summary.total_batches,
            batch_size = self.config.batch_size,
            "split records into batches"
        );

        MigrationJob::set_totals(db.pool(), job.id, summary.total_batches, summary.total_records)
            .await?;
        MigrationJob::update_status(db.pool(), job.id, JobStatus::Running).await?;

        Ok(job.id)
    }

    /// Resolve the resume decision according to policy. The interactive
    /// prompt runs once, synchronously, during planning, never in the hot
    /// path.
    async fn decide_resume(&self) -> Result<bool> {
        match self.config.resume {
            ResumePolicy::AutoResume => Ok(true),
            ResumePolicy::AlwaysNew => Ok(false),
            ResumePolicy::Ask => {
                use std::io::IsTerminal;
                if !std::io::stdin().is_terminal() {
                    info!("non-interactive stdin, defaulting to resume");
                    return Ok(true);
                }

                let line = tokio::task::spawn_blocking(|| {
                    use std::io::Write;
                    print!("\nResume existing job? (Y/n): ");
                    let _ = std::io::stdout().flush();
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line).map(|_| line)
                })
                .await
                .map_err(|e| MigratorError::Controller(format!("prompt task failed: {e}")))?
                .map_err(|e| MigratorError::Controller(format!("failed to read stdin: {e}")))?;

                let answer = line.trim().to_ascii_lowercase();
                Ok(answer.is_empty() || answer == "y" || answer == "yes")
            }
        }
    }

    // ---------------- Worker management ----------------

    /// Spawn the worker pool as child processes of the current executable.
    fn spawn_workers(&mut self, job_id: Uuid) -> Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| MigratorError::Controller(format!("cannot locate executable: {e}")))?;

        info!(count = self.config.max_workers, "spawning worker processes");
        self.workers = Vec::with_capacity(self.config.max_workers);
        self.workers_joined = false;

        for index in 0..self.config.max_workers {
            let child = Command::new(&exe)
                .arg("worker")
                .arg(job_id.to_string())
                .arg(index.to_string())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    MigratorError::Controller(format!("failed to spawn worker {index}: {e}"))
                })?;

            info!(index, pid = child.id(), "started worker");
            self.workers.push(child);
        }

        Ok(())
    }

    async fn join_workers(&mut self) {
        if self.workers_joined {
            return;
        }
        info!("waiting for workers to exit");
        for (index, child) in self.workers.iter_mut().enumerate() {
            match child.wait().await {
                Ok(status) if status.success() => info!(index, "worker exited"),
                Ok(status) => warn!(index, %status, "worker exited with failure"),
                Err(err) => warn!(index, error = %err, "failed to join worker"),
            }
        }
        self.workers_joined = true;
        info!("all workers have exited");
    }

    /// Terminate workers with a grace period, then forcefully kill
    /// stragglers.
    async fn shutdown_workers(&mut self) {
        info!("shutting down workers");
        let grace = self.config.worker_grace_period();

        #[cfg(unix)]
        for child in &self.workers {
            if let Some(pid) = child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        for (index, child) in self.workers.iter_mut().enumerate() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => info!(index, %status, "worker stopped"),
                Ok(Err(err)) => warn!(index, error = %err, "failed to join worker"),
                Err(_) => {
                    warn!(index, "worker did not stop within grace period, killing");
                    if child.start_kill().is_ok() {
                        let _ = child.wait().await;
                    }
                }
            }
        }

        self.workers_joined = true;
        info!("all workers stopped");
    }

    // ---------------- Monitoring ----------------

    /// Poll aggregate stats until the job drains or shutdown is requested.
    /// Returns whether the job actually finished.
    async fn monitor_job(&mut self, store: &CoordinationStore, job_id: Uuid) -> Result<bool> {
        info!(%job_id, "monitoring job progress");
        let interval = self.config.monitor_interval();

        while !*self.shutdown.borrow() {
            if self.config.reclaim_during_monitoring {
                store.reset_stuck_batches(job_id).await?;
            }
            store.update_job_stats(job_id).await?;
            let stats = store.job_stats(job_id).await?;

            info!(
                completed = stats.completed_batches,
                total = stats.total_batches(),
                processing = stats.processing_batches,
                pending = stats.pending_batches,
                failed = stats.failed_batches,
                processed_records = stats.processed_records,
                failed_records = stats.failed_records,
                "progress"
            );

            if stats.is_drained() {
                let final_status = if stats.failed_batches == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                MigrationJob::update_status(store.pool(), job_id, final_status).await?;
                info!(%job_id, status = %final_status, "job finished");
                return Ok(true);
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    #[tokio::test]
    async fn test_decide_resume_policies() {
        let (_tx, rx) = watch::channel(false);

        let auto = MigrationController::new(
            MigratorConfig {
                resume: ResumePolicy::AutoResume,
                ..MigratorConfig::default()
            },
            rx.clone(),
        );
        assert!(auto.decide_resume().await.unwrap());

        let fresh = MigrationController::new(
            MigratorConfig {
                resume: ResumePolicy::AlwaysNew,
                ..MigratorConfig::default()
            },
            rx,
        );
        assert!(!fresh.decide_resume().await.unwrap());
    }
}

//! # Migration Worker
//!
//! Single-process loop that repeatedly claims one batch, fetches its
//! records, runs the record transformer per record, reports incremental
//! progress as deltas, and finalizes the batch as completed or
//! failed-with-retry.
//!
//! ## Failure isolation
//!
//! Per-record failures (transform rejection or infrastructure error on one
//! record) only increment the batch's failure counter. Batch-level failures
//! (source unreachable, shutdown mid-batch) route the whole batch to
//! `mark_batch_failed(retry=true)` so it becomes reclaimable rather than
//! stuck. Nothing is re-thrown past the batch boundary except the
//! cooperative-shutdown marker, which ends the worker's main loop.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MigratorConfig;
use crate::database::DatabaseConnection;
use crate::error::{MigratorError, Result};
use crate::models::batch::MigrationBatch;
use crate::sources::{HttpIndexWriter, PgRecordSource, RecordSource, RecordTransformer};
use crate::store::{CoordinationStore, StorePolicy};

/// Loop knobs, extracted from [`MigratorConfig`] so the worker itself stays
/// testable without a full configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Sleep between empty claim polls.
    pub poll_interval: Duration,
    /// Consecutive empty polls before the worker assumes the job is drained.
    pub empty_poll_limit: u32,
    /// Flush progress deltas every this many attempted records.
    pub progress_every: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            empty_poll_limit: 10,
            progress_every: 10,
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            poll_interval: config.worker_poll_interval(),
            empty_poll_limit: config.empty_poll_limit,
            progress_every: config.progress_every.max(1),
        }
    }
}

/// Worker identity string: host, process ID, and pool index. Disambiguates
/// log lines and backs the store's ownership checks.
pub fn derive_worker_id(pool_index: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}-{}-{pool_index}", std::process::id())
}

/// A single worker's claim/process/report loop over one job.
pub struct MigrationWorker<S, T> {
    job_id: Uuid,
    worker_id: String,
    store: CoordinationStore,
    source: S,
    transformer: T,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
}

impl<S: RecordSource, T: RecordTransformer> MigrationWorker<S, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Uuid,
        worker_id: String,
        store: CoordinationStore,
        source: S,
        transformer: T,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            store,
            source,
            transformer,
            settings,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Main loop: claim until the job looks drained or shutdown is
    /// requested.
    #[instrument(skip(self), fields(job_id = %self.job_id, worker_id = %self.worker_id))]
    pub async fn run(&mut self) -> Result<()> {
        info!("worker starting");

        let mut consecutive_empty_polls = 0u32;

        while !self.shutdown_requested() {
            let batch = self
                .store
                .claim_next_batch(self.job_id, &self.worker_id)
                .await?;

            match batch {
                Some(batch) => {
                    consecutive_empty_polls = 0;
                    match self.process_batch(&batch).await {
                        Ok(()) => {}
                        Err(MigratorError::Shutdown) => break,
                        Err(err) => return Err(err),
                    }
                }
                None => {
                    consecutive_empty_polls += 1;
                    if consecutive_empty_polls >= self.settings.empty_poll_limit {
                        info!(
                            polls = consecutive_empty_polls,
                            "no batches available, assuming job is drained"
                        );
                        break;
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        info!("worker finished");
        Ok(())
    }

    /// Process one claimed batch end to end and finalize its state.
    ///
    /// Errors raised while working the batch are resolved here into a
    /// failed-with-retry transition; only the shutdown marker propagates.
    #[instrument(
        skip(self, batch),
        fields(batch_number = batch.batch_number, retry_count = batch.retry_count)
    )]
    async fn process_batch(&self, batch: &MigrationBatch) -> Result<()> {
        info!(records = batch.record_ids.len(), "processing batch");

        match self.process_records(batch).await {
            Ok(()) => {
                self.store
                    .mark_batch_completed(batch.id, &self.worker_id)
                    .await?;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "batch failed");
                self.store
                    .mark_batch_failed(batch.id, &self.worker_id, &err.to_string(), true)
                    .await?;
                if matches!(err, MigratorError::Shutdown) {
                    Err(MigratorError::Shutdown)
                } else {
                    // Resolved into a state transition; the loop moves on.
                    Ok(())
                }
            }
        }
    }

    async fn process_records(&self, batch: &MigrationBatch) -> Result<()> {
        let records = self.source.fetch_records(&batch.record_ids).await?;

        let mut processed_delta: i64 = 0;
        let mut failed_delta: i64 = 0;
        let mut since_flush = 0usize;

        for record in &records {
            if self.shutdown_requested() {
                // Abandoning the batch routes it to the retry path,
                // guaranteeing it becomes reclaimable rather than stuck.
                self.flush_progress(batch, &mut processed_delta, &mut failed_delta)
                    .await?;
                return Err(MigratorError::Shutdown);
            }

            if !record.has_content() {
                debug!(record_id = record.id, "skipping record with empty content");
                continue;
            }

            match self.transformer.process_record(record).await {
                Ok(true) => processed_delta += 1,
                Ok(false) => {
                    debug!(record_id = record.id, "transformer rejected record");
                    failed_delta += 1;
                }
                Err(err) => {
                    warn!(record_id = record.id, error = %err, "record transform failed");
                    failed_delta += 1;
                }
            }

            since_flush += 1;
            if since_flush >= self.settings.progress_every {
                self.flush_progress(batch, &mut processed_delta, &mut failed_delta)
                    .await?;
                since_flush = 0;
            }
        }

        self.flush_progress(batch, &mut processed_delta, &mut failed_delta)
            .await?;
        Ok(())
    }

    /// Report accumulated deltas and reset them. Deltas, not running totals,
    /// so partial reports survive a crash without double-counting.
    async fn flush_progress(
        &self,
        batch: &MigrationBatch,
        processed_delta: &mut i64,
        failed_delta: &mut i64,
    ) -> Result<()> {
        if *processed_delta == 0 && *failed_delta == 0 {
            return Ok(());
        }

        self.store
            .bump_batch_progress(batch.id, &self.worker_id, *processed_delta, *failed_delta)
            .await?;
        *processed_delta = 0;
        *failed_delta = 0;
        Ok(())
    }
}

/// Entry point for a spawned worker process: open connections (only after
/// the process exists), run the loop, close everything.
pub async fn run_worker_process(
    job_id: Uuid,
    pool_index: usize,
    config: &MigratorConfig,
) -> Result<()> {
    let worker_id = derive_worker_id(pool_index);
    info!(%job_id, %worker_id, "initializing worker");

    let coordination = DatabaseConnection::connect(&config.database_url()?).await?;
    coordination.health_check().await?;
    let source_db = DatabaseConnection::connect(&config.source_database_url()?).await?;
    source_db.health_check().await?;

    let store = CoordinationStore::new(
        coordination.pool().clone(),
        StorePolicy::from_config(config),
    );
    let source = PgRecordSource::new(source_db.pool().clone());
    let transformer = HttpIndexWriter::new(config.index_url.clone());

    let shutdown = crate::signals::shutdown_listener()
        .map_err(|e| MigratorError::Worker(format!("failed to install signal handlers: {e}")))?;

    let mut worker = MigrationWorker::new(
        job_id,
        worker_id,
        store,
        source,
        transformer,
        WorkerSettings::from_config(config),
        shutdown,
    );

    let result = worker.run().await;

    source_db.close().await;
    coordination.close().await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_shape() {
        let id = derive_worker_id(3);
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts[0], "3");
        assert_eq!(parts[1], std::process::id().to_string());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.empty_poll_limit, 10);
        assert_eq!(settings.progress_every, 10);
    }

    #[test]
    fn test_progress_every_floor() {
        let config = MigratorConfig {
            progress_every: 0,
            ..MigratorConfig::default()
        };
        assert_eq!(WorkerSettings::from_config(&config).progress_every, 1);
    }
}

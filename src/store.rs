//! # Coordination Store Client
//!
//! Typed accessor over the durable job/batch tables, exposing the atomic
//! operations every worker and the controller synchronize through. Each
//! primitive is a single transactional `UPDATE ... WHERE ... RETURNING`
//! statement; claim and reclaim select their victim rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent callers never block each other
//! and never observe the same row.
//!
//! Ownership of a processing batch is enforced by conditioning every
//! mutation on `worker_id` equality. A zombie worker whose batch was
//! reclaimed gets `None`/no-op results back, never an error: the
//! authoritative state has already moved on.

use std::time::Duration;

use sqlx::{FromRow, PgPool};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::MigratorConfig;
use crate::error::Result;
use crate::models::batch::{BatchStatus, MigrationBatch, ReclaimedBatch};

/// Retry and timeout knobs the store applies on behalf of its callers.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Batch retry budget.
    pub max_retries: i32,
    /// Age after which a processing batch is considered stuck.
    pub batch_timeout: Duration,
    /// Base delay for stuck-batch retry backoff.
    pub base_delay: Duration,
    /// Cap on the computed backoff delay.
    pub backoff_cap: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            batch_timeout: Duration::from_secs(600),
            base_delay: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(1800),
        }
    }
}

impl StorePolicy {
    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            batch_timeout: config.batch_timeout(),
            base_delay: Duration::from_secs(config.stuck_base_delay_secs),
            backoff_cap: Duration::from_secs(config.stuck_backoff_cap_secs),
        }
    }
}

/// Read-only aggregate of a job's batch and record counters, computed
/// server-side so per-batch rows never ship to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct JobStats {
    pub completed_batches: i64,
    pub failed_batches: i64,
    pub pending_batches: i64,
    pub processing_batches: i64,
    pub processed_records: i64,
    pub failed_records: i64,
}

impl JobStats {
    pub fn total_batches(&self) -> i64 {
        self.completed_batches + self.failed_batches + self.pending_batches
            + self.processing_batches
    }

    /// No work left to schedule: nothing pending and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.pending_batches == 0 && self.processing_batches == 0
    }
}

/// Client for the coordination store's atomic batch operations.
#[derive(Clone)]
pub struct CoordinationStore {
    pool: PgPool,
    policy: StorePolicy,
}

impl CoordinationStore {
    pub fn new(pool: PgPool, policy: StorePolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> &StorePolicy {
        &self.policy
    }

    /// Atomically claim the lowest-numbered eligible pending batch for
    /// `worker_id`, or `None` when no batch is claimable.
    ///
    /// Batches whose `next_retry_at` lies in the future are skipped, which
    /// is how stuck-batch backoff is enforced. `SKIP LOCKED` guarantees two
    /// concurrent claimers never receive the same row.
    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker_id))]
    pub async fn claim_next_batch(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<MigrationBatch>> {
        let batch = sqlx::query_as::<_, MigrationBatch>(
            r#"
            UPDATE migration_batches
            SET status = 'processing',
                worker_id = $2,
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM migration_batches
                WHERE job_id = $1
                  AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY batch_number ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match &batch {
            Some(b) => info!(
                batch_number = b.batch_number,
                records = b.record_ids.len(),
                retry_count = b.retry_count,
                "claimed batch"
            ),
            None => debug!("no pending batch available"),
        }

        Ok(batch)
    }

    /// Add progress deltas to a batch's counters, but only while it is still
    /// processing and owned by `worker_id`. Returns `None` when ownership no
    /// longer matches, guarding against stale reports from zombie workers.
    #[instrument(skip(self), fields(batch_id = %batch_id, worker_id = %worker_id))]
    pub async fn bump_batch_progress(
        &self,
        batch_id: Uuid,
        worker_id: &str,
        processed_delta: i64,
        failed_delta: i64,
    ) -> Result<Option<MigrationBatch>> {
        let batch = sqlx::query_as::<_, MigrationBatch>(
            r#"
            UPDATE migration_batches
            SET processed_count = processed_count + $3,
                failed_count = failed_count + $4,
                updated_at = NOW()
            WHERE id = $1
              AND worker_id = $2
              AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(batch_id)
        .bind(worker_id)
        .bind(processed_delta)
        .bind(failed_delta)
        .fetch_optional(&self.pool)
        .await?;

        if batch.is_none() {
            warn!(
                processed_delta,
                failed_delta, "progress report rejected: batch reclaimed or not owned"
            );
        }

        Ok(batch)
    }

    /// Transition a batch from processing to completed, conditioned on
    /// current ownership. Silently no-ops when the batch was reclaimed.
    #[instrument(skip(self), fields(batch_id = %batch_id, worker_id = %worker_id))]
    pub async fn mark_batch_completed(&self, batch_id: Uuid, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE migration_batches
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1
              AND worker_id = $2
              AND status = 'processing'
            "#,
        )
        .bind(batch_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("completion ignored: batch reclaimed or not owned");
        } else {
            info!("batch completed");
        }

        Ok(())
    }

    /// Record a batch failure. While the retry budget lasts and `retry` is
    /// set, the batch returns to pending with an incremented `retry_count`
    /// and cleared ownership; otherwise it becomes terminally failed.
    /// Returns whether the batch was rescheduled for retry.
    ///
    /// The budget check compares the pre-increment `retry_count`, so a batch
    /// fails permanently on its `max_retries + 1`-th failure.
    #[instrument(skip(self, error), fields(batch_id = %batch_id, worker_id = %worker_id, retry))]
    pub async fn mark_batch_failed(
        &self,
        batch_id: Uuid,
        worker_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<bool> {
        let row = sqlx::query_as::<_, (BatchStatus, i32)>(
            r#"
            UPDATE migration_batches
            SET status = CASE WHEN $4 AND retry_count < $5 THEN 'pending' ELSE 'failed' END,
                retry_count = retry_count + 1,
                error_message = $3,
                worker_id = CASE WHEN $4 AND retry_count < $5 THEN NULL ELSE worker_id END,
                claimed_at = CASE WHEN $4 AND retry_count < $5 THEN NULL ELSE claimed_at END,
                updated_at = NOW()
            WHERE id = $1
              AND worker_id = $2
              AND status = 'processing'
            RETURNING status, retry_count
            "#,
        )
        .bind(batch_id)
        .bind(worker_id)
        .bind(error)
        .bind(retry)
        .bind(self.policy.max_retries)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((BatchStatus::Pending, retry_count)) => {
                warn!(
                    retry_count,
                    max_retries = self.policy.max_retries,
                    error,
                    "batch failed, rescheduled for retry"
                );
                Ok(true)
            }
            Some((_, retry_count)) => {
                warn!(retry_count, error, "batch permanently failed");
                Ok(false)
            }
            None => {
                debug!("failure report ignored: batch reclaimed or not owned");
                Ok(false)
            }
        }
    }

    /// Reclaim batches stuck in processing past the configured timeout.
    ///
    /// Each stuck batch either returns to pending with an incremented
    /// `retry_count` and a `next_retry_at` of
    /// `min(base_delay * 2^retry_count + jitter, backoff_cap)` from now, or
    /// becomes terminally failed once its retry budget is spent. Victim rows
    /// are selected with `SKIP LOCKED` so reclamation never deadlocks with
    /// live workers claiming other rows.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn reset_stuck_batches(&self, job_id: Uuid) -> Result<Vec<ReclaimedBatch>> {
        let reclaimed = sqlx::query_as::<_, ReclaimedBatch>(
            r#"
            WITH stuck AS (
                SELECT id, retry_count FROM migration_batches
                WHERE job_id = $1
                  AND status = 'processing'
                  AND claimed_at < NOW() - make_interval(secs => $2)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE migration_batches b
            SET status = CASE WHEN s.retry_count < $3 THEN 'pending' ELSE 'failed' END,
                retry_count = s.retry_count + 1,
                worker_id = NULL,
                claimed_at = NULL,
                error_message = 'batch processing timed out',
                next_retry_at = CASE WHEN s.retry_count < $3 THEN
                    NOW() + make_interval(
                        secs => LEAST(
                            $4 * power(2::float8, s.retry_count::float8) + random() * $4,
                            $5
                        )
                    )
                ELSE NULL END,
                updated_at = NOW()
            FROM stuck s
            WHERE b.id = s.id
            RETURNING b.id, b.batch_number, b.status, b.retry_count, b.next_retry_at
            "#,
        )
        .bind(job_id)
        .bind(self.policy.batch_timeout.as_secs_f64())
        .bind(self.policy.max_retries)
        .bind(self.policy.base_delay.as_secs_f64())
        .bind(self.policy.backoff_cap.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        if !reclaimed.is_empty() {
            let retried = reclaimed
                .iter()
                .filter(|b| b.status == BatchStatus::Pending)
                .count();
            warn!(
                reclaimed = reclaimed.len(),
                retried,
                permanently_failed = reclaimed.len() - retried,
                "reset stuck batches"
            );
            for batch in &reclaimed {
                match batch.status {
                    BatchStatus::Failed => warn!(
                        batch_number = batch.batch_number,
                        retry_count = batch.retry_count,
                        "stuck batch permanently failed"
                    ),
                    _ => info!(
                        batch_number = batch.batch_number,
                        retry_count = batch.retry_count,
                        next_retry_at = ?batch.next_retry_at,
                        "stuck batch rescheduled"
                    ),
                }
            }
        }

        Ok(reclaimed)
    }

    /// Server-side aggregate of a job's batch and record counters.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn job_stats(&self, job_id: Uuid) -> Result<JobStats> {
        let stats = sqlx::query_as::<_, JobStats>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_batches,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_batches,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending_batches,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing_batches,
                COALESCE(SUM(processed_count), 0)::BIGINT AS processed_records,
                COALESCE(SUM(failed_count), 0)::BIGINT AS failed_records
            FROM migration_batches
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Roll batch aggregates up onto the job row. The counters are
    /// recomputed from batch state, never decremented by callers.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn update_job_stats(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_jobs j
            SET completed_batches = s.completed_batches,
                failed_batches = s.failed_batches,
                processed_records = s.processed_records,
                failed_records = s.failed_records,
                updated_at = NOW()
            FROM (
                SELECT
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed_batches,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed_batches,
                    COALESCE(SUM(processed_count), 0)::BIGINT AS processed_records,
                    COALESCE(SUM(failed_count), 0)::BIGINT AS failed_records
                FROM migration_batches
                WHERE job_id = $1
            ) s
            WHERE j.id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = StorePolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.batch_timeout, Duration::from_secs(600));
        assert_eq!(policy.base_delay, Duration::from_secs(30));
        assert_eq!(policy.backoff_cap, Duration::from_secs(1800));
    }

    #[test]
    fn test_job_stats_drained() {
        let stats = JobStats {
            completed_batches: 3,
            failed_batches: 1,
            pending_batches: 0,
            processing_batches: 0,
            processed_records: 25,
            failed_records: 2,
        };
        assert!(stats.is_drained());
        assert_eq!(stats.total_batches(), 4);

        let busy = JobStats {
            processing_batches: 1,
            ..stats
        };
        assert!(!busy.is_drained());
    }
}

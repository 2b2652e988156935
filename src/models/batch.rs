//! # Migration Batch Model
//!
//! A batch is the claimable unit of work: an ordered set of record IDs owned
//! by exactly one job. The `record_ids` array is authoritative; `start_id`
//! and `end_id` are informational bounds only.
//!
//! ## Ownership invariant
//!
//! At most one worker holds a batch in `processing` at any time. Every
//! mutation of a processing batch is conditioned on `worker_id` equality in
//! [`crate::store::CoordinationStore`], so a zombie worker's stale writes
//! are rejected rather than corrupting state. `worker_id` and `claimed_at`
//! are meaningful only while status is `processing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Batch status enum, stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a migration batch row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MigrationBatch {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub batch_number: i64,
    pub status: BatchStatus,
    pub start_id: i64,
    pub end_id: i64,
    pub record_ids: Vec<i64>,
    pub processed_count: i64,
    pub failed_count: i64,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome row returned by stuck-batch reclamation.
#[derive(Debug, Clone, FromRow)]
pub struct ReclaimedBatch {
    pub id: uuid::Uuid,
    pub batch_number: i64,
    pub status: BatchStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl MigrationBatch {
    pub async fn find_by_id(
        pool: &PgPool,
        id: uuid::Uuid,
    ) -> Result<Option<MigrationBatch>, sqlx::Error> {
        sqlx::query_as::<_, MigrationBatch>("SELECT * FROM migration_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_job(
        pool: &PgPool,
        job_id: uuid::Uuid,
    ) -> Result<Vec<MigrationBatch>, sqlx::Error> {
        sqlx::query_as::<_, MigrationBatch>(
            "SELECT * FROM migration_batches WHERE job_id = $1 ORDER BY batch_number",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await
    }
}

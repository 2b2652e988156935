//! # Migration Job Model
//!
//! One row per end-to-end migration run. Jobs carry aggregate counters that
//! are recomputed from batch aggregates by the controller's monitoring loop;
//! they are informational rollups, never the source of truth for scheduling
//! decisions (the batch rows are).
//!
//! ## Lifecycle
//!
//! Created `pending` by the planner with placeholder totals, set `running`
//! once batches exist, and finished `completed` (no failed batches) or
//! `failed` by the monitoring loop. Terminal jobs are never mutated again
//! except by an explicit resume decision that resets them to `running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Job status enum, stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a migration job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MigrationJob {
    pub id: uuid::Uuid,
    pub status: JobStatus,
    pub total_batches: i64,
    pub completed_batches: i64,
    pub failed_batches: i64,
    pub total_records: i64,
    pub processed_records: i64,
    pub failed_records: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationJob {
    /// Create a new pending job. Totals are placeholders until the planner
    /// has partitioned the ID space.
    pub async fn create(pool: &PgPool) -> Result<MigrationJob, sqlx::Error> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            INSERT INTO migration_jobs (status, metadata)
            VALUES ('pending', jsonb_build_object('start_time', NOW()::text))
            RETURNING *
            "#,
        )
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: uuid::Uuid,
    ) -> Result<Option<MigrationJob>, sqlx::Error> {
        sqlx::query_as::<_, MigrationJob>("SELECT * FROM migration_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Jobs that are candidates for resumption, most recent first.
    pub async fn active(pool: &PgPool) -> Result<Vec<MigrationJob>, sqlx::Error> {
        sqlx::query_as::<_, MigrationJob>(
            r#"
            SELECT * FROM migration_jobs
            WHERE status IN ('pending', 'running')
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(pool)
        .await
    }

    /// Update job status. Terminal transitions stamp an `end_time` into the
    /// metadata map.
    pub async fn update_status(
        pool: &PgPool,
        id: uuid::Uuid,
        status: JobStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET status = $2,
                metadata = CASE WHEN $3 THEN
                    metadata || jsonb_build_object('end_time', NOW()::text)
                ELSE metadata END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(status.is_terminal())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record the planner's actual totals after batch creation.
    pub async fn set_totals(
        pool: &PgPool,
        id: uuid::Uuid,
        total_batches: i64,
        total_records: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE migration_jobs
            SET total_batches = $2, total_records = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_batches)
        .bind(total_records)
        .execute(pool)
        .await?;
        Ok(())
    }
}

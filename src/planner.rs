//! # Batch Planner
//!
//! Splits the exported record-ID space into fixed-size batches with a single
//! server-side statement: row-numbering the ID set, grouping into batches,
//! and inserting with `ON CONFLICT DO NOTHING`. The full ID set never enters
//! this process's memory, and re-running the planner for the same job cannot
//! create duplicate batch numbers.

use sqlx::{FromRow, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{MigratorError, Result};

/// Result of one planning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct PlanSummary {
    pub total_records: i64,
    pub total_batches: i64,
    /// Batches actually inserted by this pass; lower than `total_batches`
    /// when a previous pass already created some.
    pub inserted_batches: i64,
}

/// Number of batches a planning pass produces for a given ID count.
pub fn batch_count(total_records: i64, batch_size: i64) -> i64 {
    if total_records <= 0 || batch_size <= 0 {
        return 0;
    }
    (total_records + batch_size - 1) / batch_size
}

/// Partition `migration_source_ids` into pending batches for `job_id`.
///
/// Returns a [`MigratorError::Planning`] when the source holds zero eligible
/// records; the caller must not start the job in that case.
#[instrument(skip(pool), fields(job_id = %job_id, batch_size))]
pub async fn create_batches(
    pool: &PgPool,
    job_id: Uuid,
    batch_size: i64,
) -> Result<PlanSummary> {
    if batch_size <= 0 {
        return Err(MigratorError::Planning(format!(
            "batch_size must be positive, got {batch_size}"
        )));
    }

    let summary = sqlx::query_as::<_, PlanSummary>(
        r#"
        WITH numbered AS (
            SELECT record_id,
                   (ROW_NUMBER() OVER (ORDER BY record_id) - 1) / $2 AS batch_number
            FROM migration_source_ids
        ),
        grouped AS (
            SELECT batch_number,
                   MIN(record_id) AS start_id,
                   MAX(record_id) AS end_id,
                   ARRAY_AGG(record_id ORDER BY record_id) AS record_ids
            FROM numbered
            GROUP BY batch_number
        ),
        inserted AS (
            INSERT INTO migration_batches (
                job_id, batch_number, status, start_id, end_id, record_ids
            )
            SELECT $1, batch_number, 'pending', start_id, end_id, record_ids
            FROM grouped
            ON CONFLICT (job_id, batch_number) DO NOTHING
            RETURNING id
        )
        SELECT
            (SELECT COUNT(*) FROM numbered) AS total_records,
            (SELECT COUNT(*) FROM grouped) AS total_batches,
            (SELECT COUNT(*) FROM inserted) AS inserted_batches
        "#,
    )
    .bind(job_id)
    .bind(batch_size)
    .fetch_one(pool)
    .await?;

    if summary.total_records == 0 {
        return Err(MigratorError::Planning(
            "no eligible records found in migration_source_ids".to_string(),
        ));
    }

    if summary.inserted_batches < summary.total_batches {
        warn!(
            inserted = summary.inserted_batches,
            existing = summary.total_batches - summary.inserted_batches,
            total_batches = summary.total_batches,
            total_records = summary.total_records,
            "planning pass found existing batches"
        );
    } else {
        info!(
            total_batches = summary.total_batches,
            total_records = summary.total_records,
            "created batches"
        );
    }

    Ok(summary)
}

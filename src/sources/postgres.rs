//! Reference source reader: fetches records by ID from a Postgres table.
//!
//! Production deployments point this at the legacy database (or replace it
//! with a source-specific implementation); rows are returned in the order of
//! the requested IDs so batch processing order stays stable.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

use super::{RecordSource, SourceRecord};

pub struct PgRecordSource {
    pool: PgPool,
}

impl PgRecordSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn fetch_records(&self, ids: &[i64]) -> Result<Vec<SourceRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list: Vec<i64> = ids.to_vec();
        let records = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT record_id, member_code, content
            FROM migration_source_records
            WHERE record_id = ANY($1)
            ORDER BY array_position($1, record_id)
            "#,
        )
        .bind(&id_list)
        .fetch_all(&self.pool)
        .await?;

        // Missing IDs are dropped, not errors: the source may have purged
        // rows since the ID export.
        if records.len() < ids.len() {
            debug!(
                requested = ids.len(),
                fetched = records.len(),
                dropped = ids.len() - records.len(),
                "source returned fewer records than requested"
            );
        }

        Ok(records)
    }
}

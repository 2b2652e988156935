//! External collaborator seams: the source reader and the record
//! transformer.
//!
//! The orchestration core never inspects record content beyond the
//! empty-payload check; it only counts per-record success and failure. Both
//! collaborators are consumed behind async traits so tests and alternative
//! backends can stand in for the reference implementations.

pub mod index;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use index::HttpIndexWriter;
pub use postgres::PgRecordSource;

/// A raw record fetched from the legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceRecord {
    #[sqlx(rename = "record_id")]
    pub id: i64,
    pub member_code: String,
    pub content: String,
}

impl SourceRecord {
    /// Empty source content cannot be transformed meaningfully; such records
    /// are dropped before processing, counted as neither processed nor
    /// failed.
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Yields raw records for a batch's ID set.
///
/// Implementations must silently drop unfetchable or malformed IDs rather
/// than failing the whole call; the returned list may be shorter than the
/// input and must be de-duplicated.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(&self, ids: &[i64]) -> Result<Vec<SourceRecord>>;
}

/// Turns one source record into indexed artifacts downstream.
///
/// Expected data-quality rejections surface as `Ok(false)`; only
/// infrastructure failures return `Err`, which the worker treats as a
/// per-record failure and continues.
#[async_trait]
pub trait RecordTransformer: Send + Sync {
    async fn process_record(&self, record: &SourceRecord) -> Result<bool>;
}

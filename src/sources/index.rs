//! Reference record transformer: writes each record as a document to a
//! downstream index over HTTP.
//!
//! Downstream writes are idempotent on record ID, which is what lets the
//! orchestrator target at-least-once delivery.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::{MigratorError, Result};

use super::{RecordTransformer, SourceRecord};

pub struct HttpIndexWriter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIndexWriter {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl RecordTransformer for HttpIndexWriter {
    async fn process_record(&self, record: &SourceRecord) -> Result<bool> {
        let document = json!({
            "id": record.id,
            "member_code": record.member_code,
            "content": record.content,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&document)
            .send()
            .await
            .map_err(|e| {
                MigratorError::Transform(format!("index write for record {}: {e}", record.id))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(record_id = record.id, "indexed record");
            return Ok(true);
        }

        // Client errors are data-quality rejections, not infrastructure
        // failures.
        if status.is_client_error() {
            debug!(record_id = record.id, %status, "index rejected record");
            return Ok(false);
        }

        Err(MigratorError::Transform(format!(
            "index write for record {} returned {status}",
            record.id
        )))
    }
}

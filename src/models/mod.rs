//! Data layer for the coordination store.
//!
//! Jobs and batches are the only rows this subsystem persists. All
//! concurrency-sensitive mutations go through
//! [`crate::store::CoordinationStore`]; the associated functions here cover
//! plain CRUD and lookups.

pub mod batch;
pub mod job;

pub use batch::{BatchStatus, MigrationBatch, ReclaimedBatch};
pub use job::{JobStatus, MigrationJob};

//! # Migrator Core
//!
//! Orchestration core for migrating a large, immutable record set from a
//! legacy relational source into a downstream index. Work is fanned out to
//! a pool of independent worker processes; all cross-process coordination
//! happens through conditional updates on job/batch rows in PostgreSQL.
//!
//! ## Guarantees
//!
//! - No record range is processed twice concurrently: batch claiming uses
//!   `FOR UPDATE SKIP LOCKED` and every mutation of a processing batch is
//!   conditioned on worker ownership.
//! - Transient failures are retried with a bounded, capped-exponential
//!   backoff.
//! - The whole job is resumable after a crash of the controller or any
//!   worker: job/batch state lives in the store, and stuck batches are
//!   reclaimed by claim-age timeout.
//! - Progress is observable in real time via server-side aggregates.
//!
//! Delivery to the downstream index is at-least-once with idempotent
//! writes, not exactly-once.
//!
//! ## Module Organization
//!
//! - [`models`] - job and batch rows in the coordination store
//! - [`store`] - the atomic claim/progress/finalize/reclaim primitives
//! - [`planner`] - idempotent server-side batch planning
//! - [`worker`] - the per-process claim/fetch/transform/report loop
//! - [`controller`] - two-phase planning/execution lifecycle and monitoring
//! - [`sources`] - source reader and record transformer seams
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling

pub mod config;
pub mod controller;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod planner;
pub mod signals;
pub mod sources;
pub mod store;
pub mod worker;

pub use config::{MigratorConfig, ResumePolicy};
pub use controller::MigrationController;
pub use error::{MigratorError, Result};
pub use models::{BatchStatus, JobStatus, MigrationBatch, MigrationJob};
pub use store::{CoordinationStore, JobStats, StorePolicy};
pub use worker::{MigrationWorker, WorkerSettings};

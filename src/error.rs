//! Structured error handling for the migration orchestrator.
//!
//! Per-record failures are counters, not errors; stale-ownership rejections
//! from the coordination store are `None`/no-op values. Everything that does
//! surface as an error here is either fatal to the current phase (planning,
//! monitoring) or resolves into a batch state transition at the worker's
//! batch boundary.

/// Errors that can occur during migration orchestration
#[derive(Debug, thiserror::Error)]
pub enum MigratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Controller error: {0}")]
    Controller(String),

    /// Cooperative shutdown was requested. This is the only error expected
    /// to propagate out of a worker's batch-processing boundary; the
    /// in-flight batch has already been routed to the retry path.
    #[error("Shutdown requested")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, MigratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigratorError::Planning("no eligible records".to_string());
        assert_eq!(err.to_string(), "Planning error: no eligible records");

        let err = MigratorError::Shutdown;
        assert_eq!(err.to_string(), "Shutdown requested");
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: MigratorError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, MigratorError::Database(_)));
    }
}

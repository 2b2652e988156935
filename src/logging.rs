//! # Structured Logging Module
//!
//! Per-process tracing initialization. The controller and every spawned
//! worker are independent OS processes, so each calls this exactly once at
//! startup; the `OnceLock` guard makes repeated calls (e.g. from tests)
//! harmless.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging for this process.
///
/// Log level comes from `RUST_LOG` when set, otherwise defaults to
/// `info,migrator_core=debug`. Output is human-readable on the console;
/// set `MIGRATOR_LOG_JSON=1` to emit JSON lines instead (useful when
/// worker output is collected by a log shipper).
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,migrator_core=debug"));

        let json_output = std::env::var("MIGRATOR_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let result = if json_output {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_ansi(false)
                        .with_filter(filter),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_filter(filter))
                .try_init()
        };

        // A subscriber may already be installed by a test harness; that is
        // not an error.
        if result.is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        tracing::debug!(pid = std::process::id(), "logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging();
        init_logging();
    }
}

//! # Migration Configuration
//!
//! Typed configuration for the orchestrator, loaded in layers: built-in
//! defaults, then an optional `migrator.toml` file, then `MIGRATOR_`-prefixed
//! environment variables. Workers load the same configuration independently
//! after they are spawned, so nothing here is shared across the process
//! boundary.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigratorError, Result};

/// How the controller decides between resuming an existing active job and
/// planning a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Resume the most recent active job without asking.
    AutoResume,
    /// Mark active jobs failed and always plan a new job.
    AlwaysNew,
    /// Prompt once on stdin at startup; defaults to resume when stdin is
    /// not a terminal.
    Ask,
}

impl FromStr for ResumePolicy {
    type Err = MigratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto-resume" => Ok(ResumePolicy::AutoResume),
            "always-new" => Ok(ResumePolicy::AlwaysNew),
            "ask" => Ok(ResumePolicy::Ask),
            other => Err(MigratorError::Configuration(format!(
                "unknown resume policy '{other}' (expected auto-resume, always-new, or ask)"
            ))),
        }
    }
}

/// Root configuration for controller and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorConfig {
    /// Coordination store connection string. Falls back to `DATABASE_URL`.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Legacy source database. Defaults to the coordination store URL when
    /// unset (useful for staging runs where source IDs were exported into
    /// the same database).
    #[serde(default)]
    pub source_database_url: Option<String>,

    /// Downstream index document endpoint for the reference HTTP writer.
    #[serde(default = "defaults::index_url")]
    pub index_url: String,

    /// Records per batch.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: i64,

    /// Number of worker processes to spawn.
    #[serde(default = "defaults::max_workers")]
    pub max_workers: usize,

    /// Batch retry budget; a batch failing more than this many times becomes
    /// terminally failed.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: i32,

    /// Seconds a worker sleeps between empty claim polls.
    #[serde(default = "defaults::worker_poll_interval_secs")]
    pub worker_poll_interval_secs: f64,

    /// Consecutive empty polls before a worker assumes the job is drained.
    #[serde(default = "defaults::empty_poll_limit")]
    pub empty_poll_limit: u32,

    /// Flush progress deltas to the store every this many records.
    #[serde(default = "defaults::progress_every")]
    pub progress_every: usize,

    /// Age in seconds after which a processing batch is considered stuck.
    #[serde(default = "defaults::batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    /// Controller monitoring poll interval in seconds.
    #[serde(default = "defaults::monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Base delay for stuck-batch retry backoff, in seconds.
    #[serde(default = "defaults::stuck_base_delay_secs")]
    pub stuck_base_delay_secs: u64,

    /// Upper bound on the computed stuck-batch backoff, in seconds.
    #[serde(default = "defaults::stuck_backoff_cap_secs")]
    pub stuck_backoff_cap_secs: u64,

    /// Grace period before spawned workers are forcefully killed on
    /// controller shutdown, in seconds.
    #[serde(default = "defaults::worker_grace_period_secs")]
    pub worker_grace_period_secs: u64,

    /// Also run stuck-batch reclamation on every monitor tick, not only at
    /// resume time. Off by default; orphan detection is a safety net, not
    /// the primary cancellation path.
    #[serde(default)]
    pub reclaim_during_monitoring: bool,

    /// Resume decision for the planning phase.
    #[serde(default = "defaults::resume")]
    pub resume: ResumePolicy,
}

mod defaults {
    use super::ResumePolicy;

    pub fn index_url() -> String {
        "http://localhost:6333/index/documents".to_string()
    }
    pub fn batch_size() -> i64 {
        100
    }
    pub fn max_workers() -> usize {
        5
    }
    pub fn max_retries() -> i32 {
        3
    }
    pub fn worker_poll_interval_secs() -> f64 {
        1.0
    }
    pub fn empty_poll_limit() -> u32 {
        10
    }
    pub fn progress_every() -> usize {
        10
    }
    pub fn batch_timeout_secs() -> u64 {
        600
    }
    pub fn monitor_interval_secs() -> u64 {
        5
    }
    pub fn stuck_base_delay_secs() -> u64 {
        30
    }
    pub fn stuck_backoff_cap_secs() -> u64 {
        1800
    }
    pub fn worker_grace_period_secs() -> u64 {
        10
    }
    pub fn resume() -> ResumePolicy {
        ResumePolicy::Ask
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        serde_json::from_value(serde_json::json!({}))
            .expect("default configuration must deserialize")
    }
}

impl MigratorConfig {
    /// Load configuration: defaults, then `migrator.toml` (or the file named
    /// by `MIGRATOR_CONFIG`) when present, then `MIGRATOR_*` environment
    /// variables.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("MIGRATOR_CONFIG").unwrap_or_else(|_| "migrator.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("MIGRATOR")
                    .try_parsing(true)
                    .ignore_empty(true),
            );

        let loaded = builder
            .build()
            .map_err(|e| MigratorError::Configuration(format!("failed to load config: {e}")))?;

        loaded
            .try_deserialize()
            .map_err(|e| MigratorError::Configuration(format!("invalid configuration: {e}")))
    }

    /// Resolved coordination store URL; `DATABASE_URL` is the fallback.
    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| {
            MigratorError::Configuration(
                "database_url is not set and DATABASE_URL is not in the environment".to_string(),
            )
        })
    }

    /// Source database URL, defaulting to the coordination store.
    pub fn source_database_url(&self) -> Result<String> {
        match &self.source_database_url {
            Some(url) => Ok(url.clone()),
            None => self.database_url(),
        }
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.worker_poll_interval_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn worker_grace_period(&self) -> Duration {
        Duration::from_secs(self.worker_grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigratorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.empty_poll_limit, 10);
        assert_eq!(config.progress_every, 10);
        assert_eq!(config.worker_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_timeout(), Duration::from_secs(600));
        assert_eq!(config.worker_grace_period(), Duration::from_secs(10));
        assert_eq!(config.resume, ResumePolicy::Ask);
    }

    #[test]
    fn test_resume_policy_parsing() {
        assert_eq!(
            "auto-resume".parse::<ResumePolicy>().unwrap(),
            ResumePolicy::AutoResume
        );
        assert_eq!(
            "always-new".parse::<ResumePolicy>().unwrap(),
            ResumePolicy::AlwaysNew
        );
        assert_eq!("ask".parse::<ResumePolicy>().unwrap(), ResumePolicy::Ask);
        assert!("sometimes".parse::<ResumePolicy>().is_err());
    }

    #[test]
    fn test_source_url_falls_back_to_store() {
        let config = MigratorConfig {
            database_url: Some("postgres://coord".to_string()),
            ..MigratorConfig::default()
        };
        assert_eq!(config.source_database_url().unwrap(), "postgres://coord");
    }
}

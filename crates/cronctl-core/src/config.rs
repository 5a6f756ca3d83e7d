use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Name of the site-wide lock bounding how many events run at once.
pub const RUN_LOCK: &str = "run-events";
/// Events fetched from the store per due-now scan.
pub const DEFAULT_DUE_BATCH_SIZE: usize = 100;
/// Regular (non-internal) events handed to a runner per batch.
pub const DEFAULT_JOB_QUEUE_SIZE: usize = 10;
pub const DEFAULT_JOB_CONCURRENCY_LIMIT: usize = 10;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_JOB_LOCK_EXPIRY_SECS: u64 = 30 * 60;

/// Top-level config (cronctl.toml + CRONCTL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronControlConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Concurrency ceilings and lock staleness windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_job_queue_size")]
    pub job_queue_size: usize,
    /// Site-wide ceiling on `running` events; also the size of the run-events lock.
    #[serde(default = "default_job_concurrency_limit")]
    pub job_concurrency_limit: usize,
    /// A run-events lock not freed within this window is considered deadlocked.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Staleness window for per-action locks.
    #[serde(default = "default_job_lock_expiry_secs")]
    pub job_lock_expiry_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            job_queue_size: DEFAULT_JOB_QUEUE_SIZE,
            job_concurrency_limit: DEFAULT_JOB_CONCURRENCY_LIMIT,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            job_lock_expiry_secs: DEFAULT_JOB_LOCK_EXPIRY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Actions allowed to run concurrently with themselves (no per-action lock).
    #[serde(default)]
    pub concurrent_actions: Vec<String>,
    #[serde(default = "default_due_batch_size")]
    pub due_batch_size: usize,
    #[serde(default = "default_pending_cache_ttl_secs")]
    pub pending_cache_ttl_secs: u64,
    #[serde(default)]
    pub args_size: ArgsSizeConfig,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            concurrent_actions: Vec::new(),
            due_batch_size: DEFAULT_DUE_BATCH_SIZE,
            pending_cache_ttl_secs: default_pending_cache_ttl_secs(),
            args_size: ArgsSizeConfig::default(),
        }
    }
}

/// Advisory ceiling for serialized event args.
///
/// The pending-events snapshot lives in a single cache value, so every event's
/// args share one budget. Oversized args only produce a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgsSizeConfig {
    #[serde(default = "default_cache_budget_bytes")]
    pub cache_budget_bytes: usize,
    #[serde(default = "default_events_per_budget")]
    pub events_per_budget: usize,
    #[serde(default = "default_row_overhead_bytes")]
    pub row_overhead_bytes: usize,
    /// Raw payloads larger than `threshold * compression_ceiling` are flagged
    /// without compressing them first.
    #[serde(default = "default_compression_ceiling")]
    pub compression_ceiling: usize,
}

impl ArgsSizeConfig {
    /// Per-event byte threshold derived from the shared budget.
    pub fn threshold(&self) -> usize {
        (self.cache_budget_bytes / self.events_per_budget.max(1))
            .saturating_sub(self.row_overhead_bytes)
    }
}

impl Default for ArgsSizeConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: default_cache_budget_bytes(),
            events_per_budget: default_events_per_budget(),
            row_overhead_bytes: default_row_overhead_bytes(),
            compression_ceiling: default_compression_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum events executed in parallel by one runner process.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            workers: default_workers(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronctl/cronctl.db", home)
}
fn default_job_queue_size() -> usize {
    DEFAULT_JOB_QUEUE_SIZE
}
fn default_job_concurrency_limit() -> usize {
    DEFAULT_JOB_CONCURRENCY_LIMIT
}
fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_job_lock_expiry_secs() -> u64 {
    DEFAULT_JOB_LOCK_EXPIRY_SECS
}
fn default_due_batch_size() -> usize {
    DEFAULT_DUE_BATCH_SIZE
}
fn default_pending_cache_ttl_secs() -> u64 {
    60 * 60
}
fn default_cache_budget_bytes() -> usize {
    1024 * 1024 // single cache value ceiling
}
fn default_events_per_budget() -> usize {
    500
}
fn default_row_overhead_bytes() -> usize {
    200
}
fn default_compression_ceiling() -> usize {
    10
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_workers() -> usize {
    5
}

impl CronControlConfig {
    /// Load config from a TOML file with CRONCTL_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CRONCTL_LIMITS__JOB_CONCURRENCY_LIMIT=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CronControlConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONCTL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronctl/cronctl.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_threshold_from_budget() {
        let cfg = ArgsSizeConfig::default();
        // 1 MiB / 500 events, minus row overhead
        assert_eq!(cfg.threshold(), 2097 - 200);
    }

    #[test]
    fn args_threshold_never_underflows() {
        let cfg = ArgsSizeConfig {
            cache_budget_bytes: 100,
            events_per_budget: 0,
            row_overhead_bytes: 500,
            compression_ceiling: 10,
        };
        assert_eq!(cfg.threshold(), 0);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CronControlConfig::load(Some("/nonexistent/cronctl.toml")).unwrap();
        assert_eq!(cfg.limits.job_queue_size, DEFAULT_JOB_QUEUE_SIZE);
        assert_eq!(cfg.runner.poll_interval_secs, 60);
        assert!(cfg.events.concurrent_actions.is_empty());
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronctl.toml");
        std::fs::write(
            &path,
            "[limits]\njob_concurrency_limit = 3\n\n[events]\nconcurrent_actions = [\"reindex\"]\n",
        )
        .unwrap();

        let cfg = CronControlConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.limits.job_concurrency_limit, 3);
        assert_eq!(cfg.limits.job_queue_size, DEFAULT_JOB_QUEUE_SIZE);
        assert_eq!(cfg.events.concurrent_actions, vec!["reindex".to_string()]);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronctl.toml");
        std::fs::write(&path, "[limits]\njob_queue_size = \"many\"\n").unwrap();

        let err = CronControlConfig::load(path.to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}

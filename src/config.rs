//! Runtime configuration.
//!
//! A standalone TOML file plus environment-variable overrides, since this
//! crate runs as its own process with no postmaster to hold GUCs for it.
//!
//! Precedence: environment variable > TOML file value > built-in default.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

fn default_chunk_size() -> usize {
    1000
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_batch_preparers() -> usize {
    4
}

fn default_batch_inserters() -> usize {
    4
}

fn default_max_queue_size() -> usize {
    10
}

fn default_statement_timeout_secs() -> u64 {
    600
}

fn default_max_processing_hours() -> u64 {
    24
}

fn default_max_individual_row_retries() -> u64 {
    10_000
}

fn default_max_binary_error_retries() -> u64 {
    10_000
}

fn default_cycle_interval_secs() -> u64 {
    30
}

fn default_backpressure_sleep_ms() -> u64 {
    100
}

fn default_backpressure_timeout_secs() -> u64 {
    5
}

fn default_wide_table_column_threshold() -> usize {
    30
}

/// Full runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection string for the PostgreSQL database hosting
    /// `metadata.catalog`.
    pub catalog_dsn: String,

    /// Connection string for the PostgreSQL data lake. Usually the same
    /// server as `catalog_dsn`, kept separate because they need not be.
    pub lake_dsn: String,

    /// Rows per extraction query and per upsert statement.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Table-level parallelism. Defaults to hardware concurrency, matching
    /// the table processor pool's C++ fallback.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Cap on tables submitted per cycle. `None` means unbounded.
    #[serde(default)]
    pub max_tables_per_cycle: Option<usize>,

    /// Pipeline preparers per table (C7).
    #[serde(default = "default_batch_preparers")]
    pub batch_preparers: usize,

    /// Pipeline inserters per table (C7).
    #[serde(default = "default_batch_inserters")]
    pub batch_inserters: usize,

    /// Pipeline queue depth.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-statement timeout on the lake, in seconds.
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    /// Per-table, per-cycle processing time cap, in hours. Exceeding this
    /// without progress raises `CursorStall`.
    #[serde(default = "default_max_processing_hours")]
    pub max_processing_hours: u64,

    /// Bound on per-row retries during transaction-aborted recovery (§4.3.2).
    #[serde(default = "default_max_individual_row_retries")]
    pub max_individual_row_retries: u64,

    /// Bound on per-row retries during bad-encoding recovery (§4.3.2).
    #[serde(default = "default_max_binary_error_retries")]
    pub max_binary_error_retries: u64,

    /// Seconds between scheduler cycles, per engine.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Sleep between retries when a pipeline queue is full, in
    /// milliseconds.
    #[serde(default = "default_backpressure_sleep_ms")]
    pub backpressure_sleep_ms: u64,

    /// Bounded period to keep retrying a full queue before dropping the
    /// chunk and marking the table `ERROR`, in seconds.
    #[serde(default = "default_backpressure_timeout_secs")]
    pub backpressure_timeout_secs: u64,

    /// Column-count threshold above which the transfer loop (§4.1 Step 5)
    /// is replaced by the parallel chunk pipeline (§4.5). Only applies to
    /// PK-strategy tables, since the pipeline's per-chunk cursor needs a
    /// stable ordering key.
    #[serde(default = "default_wide_table_column_threshold")]
    pub wide_table_column_threshold: usize,
}

impl Config {
    /// Load configuration from a TOML file, then apply `LAKESYNC_`-prefixed
    /// environment variable overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::InvalidArgument(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| SyncError::InvalidArgument(format!("invalid config TOML: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("LAKESYNC_CATALOG_DSN") {
            self.catalog_dsn = v;
        }
        if let Ok(v) = env::var("LAKESYNC_LAKE_DSN") {
            self.lake_dsn = v;
        }
        if let Some(v) = env_usize("LAKESYNC_CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = env_usize("LAKESYNC_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Ok(v) = env::var("LAKESYNC_MAX_TABLES_PER_CYCLE") {
            self.max_tables_per_cycle = v.parse().ok();
        }
        if let Some(v) = env_usize("LAKESYNC_BATCH_PREPARERS") {
            self.batch_preparers = v;
        }
        if let Some(v) = env_usize("LAKESYNC_BATCH_INSERTERS") {
            self.batch_inserters = v;
        }
        if let Some(v) = env_usize("LAKESYNC_MAX_QUEUE_SIZE") {
            self.max_queue_size = v;
        }
        if let Some(v) = env_u64("LAKESYNC_STATEMENT_TIMEOUT_SECS") {
            self.statement_timeout_secs = v;
        }
        if let Some(v) = env_u64("LAKESYNC_MAX_PROCESSING_HOURS") {
            self.max_processing_hours = v;
        }
        if let Some(v) = env_u64("LAKESYNC_MAX_INDIVIDUAL_ROW_RETRIES") {
            self.max_individual_row_retries = v;
        }
        if let Some(v) = env_u64("LAKESYNC_MAX_BINARY_ERROR_RETRIES") {
            self.max_binary_error_retries = v;
        }
        if let Some(v) = env_u64("LAKESYNC_CYCLE_INTERVAL_SECS") {
            self.cycle_interval_secs = v;
        }
        if let Some(v) = env_usize("LAKESYNC_WIDE_TABLE_COLUMN_THRESHOLD") {
            self.wide_table_column_threshold = v;
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn max_processing_duration(&self) -> Duration {
        Duration::from_secs(self.max_processing_hours * 3600)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn backpressure_sleep(&self) -> Duration {
        Duration::from_millis(self.backpressure_sleep_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_secs(self.backpressure_timeout_secs)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        catalog_dsn = "postgres://localhost/catalog"
        lake_dsn = "postgres://localhost/lake"
        "#
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.batch_preparers, 4);
        assert_eq!(config.batch_inserters, 4);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.statement_timeout_secs, 600);
        assert_eq!(config.max_processing_hours, 24);
        assert_eq!(config.max_individual_row_retries, 10_000);
        assert_eq!(config.max_binary_error_retries, 10_000);
        assert_eq!(config.wide_table_column_threshold, 30);
        assert!(config.max_tables_per_cycle.is_none());
    }

    #[test]
    fn test_explicit_overrides_toml() {
        let toml_str = r#"
        catalog_dsn = "postgres://localhost/catalog"
        lake_dsn = "postgres://localhost/lake"
        chunk_size = 500
        max_tables_per_cycle = 10
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.max_tables_per_cycle, Some(10));
    }

    #[test]
    fn test_durations() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.statement_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_processing_duration(), Duration::from_secs(24 * 3600));
        assert_eq!(config.backpressure_sleep(), Duration::from_millis(100));
        assert_eq!(config.backpressure_timeout(), Duration::from_secs(5));
    }
}

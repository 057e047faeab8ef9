//! Pipeline configuration, loaded from TOML.
//!
//! ```toml
//! [run]
//! max_concurrency = 4
//! pool_size = 4
//! shard_size = 50
//! batch_size = 500
//!
//! [window]
//! name = "ttm4q"
//! periods = 4
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [store]
//! path = "factlab.db"
//!
//! [logging]
//! filter = "info,factlab_runner=debug"
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use factlab_core::retry::RetryPolicy;
use factlab_core::rollup::WindowPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub run: RunSettings,
    pub window: WindowPolicy,
    pub retry: RetryPolicy,
    pub store: StoreSettings,
    pub inputs: InputSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Worker threads per level.
    pub max_concurrency: usize,
    /// Target-store handles shared by all tasks.
    pub pool_size: usize,
    /// Entities per pipeline shard.
    pub shard_size: usize,
    /// Rows per upsert call.
    pub batch_size: usize,
    /// Most recent facts per entity to pull; `None` pulls everything.
    pub fact_limit: Option<usize>,
    /// Entity universe. Empty means "everything the fact source knows".
    pub entities: Vec<String>,
    /// Inclusive price window; unbounded when absent.
    pub prices_from: Option<NaiveDate>,
    pub prices_to: Option<NaiveDate>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            pool_size: 4,
            shard_size: 50,
            batch_size: 500,
            fact_limit: None,
            entities: Vec::new(),
            prices_from: None,
            prices_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("factlab.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Facts CSV: entity_id, category, period_end, disclosure_time, metric, value.
    pub facts: Option<PathBuf>,
    /// Prices CSV: entity_id, timestamp, value.
    pub prices: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `FACTLAB_LOG`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        for (name, value) in [
            ("run.max_concurrency", run.max_concurrency),
            ("run.pool_size", run.pool_size),
            ("run.shard_size", run.shard_size),
            ("run.batch_size", run.batch_size),
            ("window.periods", self.window.periods),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if run.fact_limit == Some(0) {
            return Err(ConfigError::Invalid("run.fact_limit must be at least 1".into()));
        }
        if let (Some(from), Some(to)) = (run.prices_from, run.prices_to) {
            if from > to {
                return Err(ConfigError::Invalid(format!(
                    "run.prices_from ({from}) is after run.prices_to ({to})"
                )));
            }
        }
        if self.window.min_span_months > self.window.max_span_months {
            return Err(ConfigError::Invalid(format!(
                "window.min_span_months ({}) exceeds window.max_span_months ({})",
                self.window.min_span_months, self.window.max_span_months
            )));
        }
        if self.window.name.trim().is_empty() {
            return Err(ConfigError::Invalid("window.name must not be empty".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}

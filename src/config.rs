use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "ehealth-warehouse";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Records per chunk transaction.
pub const DEFAULT_BATCH_SIZE: usize = 2000;
/// How long a chunk waits on a locked database before it counts as failed.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;
/// Window (days before the reference date) that imaging encounters are spread over.
pub const DEFAULT_ENCOUNTER_WINDOW_DAYS: i64 = 730;

pub const ENV_DB_PATH: &str = "EHEALTH_DB_PATH";
pub const ENV_BATCH_SIZE: &str = "EHEALTH_BATCH_SIZE";
pub const ENV_INCREMENTAL: &str = "EHEALTH_INCREMENTAL";
pub const ENV_STATEMENT_TIMEOUT: &str = "EHEALTH_STATEMENT_TIMEOUT_SECS";
pub const ENV_INPUT_CSV: &str = "EHEALTH_INPUT_CSV";

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "info,ehealth_warehouse_lib=info"
}

/// Get the application data directory.
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ehealth-warehouse")
}

/// Default SQLite database location.
pub fn default_database_path() -> PathBuf {
    app_data_dir().join("ehealth.db")
}

/// Default location of the imaging extract.
pub fn default_input_path() -> PathBuf {
    app_data_dir().join("data").join("nih_with_reports.csv")
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by every pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub input_path: PathBuf,
    /// Chunk size for the batch loader. Always at least 1.
    pub batch_size: usize,
    /// When false, the existing-key lookup is skipped (full reload).
    pub incremental: bool,
    pub statement_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            input_path: default_input_path(),
            batch_size: DEFAULT_BATCH_SIZE,
            incremental: true,
            statement_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `EHEALTH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH) {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_INPUT_CSV) {
            config.input_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = parse_batch_size(ENV_BATCH_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_INCREMENTAL) {
            config.incremental = parse_bool(ENV_INCREMENTAL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STATEMENT_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: ENV_STATEMENT_TIMEOUT,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            config.statement_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_BATCH_SIZE,
                value: "0".into(),
                reason: "batch size must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_batch_size(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    let value = raw.trim().parse::<usize>().map_err(|e| ConfigError::InvalidValue {
        key,
        value: raw.into(),
        reason: e.to_string(),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.into(),
            reason: "batch size must be at least 1".into(),
        });
    }
    Ok(value)
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.into(),
            reason: "expected true/false".into(),
        }),
    }
}

//! Engine configuration.
//!
//! Resolution order (later wins):
//! 1. built-in defaults
//! 2. optional TOML file (`DPLEDGER_CONFIG` or an explicit path)
//! 3. `DPLEDGER_*` environment overrides
//!
//! Supported environment overrides:
//! - `DPLEDGER_DB`
//! - `DPLEDGER_MAX_EPSILON_PER_JOB`
//! - `DPLEDGER_DEFAULT_EPSILON`
//! - `DPLEDGER_DEFAULT_DELTA`
//! - `DPLEDGER_HISTOGRAM_MAX_CATEGORIES`
//! - `DPLEDGER_FETCH_TIMEOUT_MS`
//! - `DPLEDGER_MAX_FETCH_WORKERS`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "DPLEDGER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration invalid: {0}")]
    Validation(String),
}

/// Settings shared by the services and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// SQLite database holding ledger and registry state.
    pub database_path: PathBuf,
    /// Ceiling written to the policy row the first time it is read.
    pub default_max_epsilon_per_job: f64,
    /// Allocation given to the budget created with each new dataset.
    pub default_epsilon_allocation: f64,
    pub default_delta_allocation: f64,
    /// Histogram columns with more distinct values are skipped.
    pub histogram_max_categories: usize,
    pub fetch_timeout_ms: u64,
    /// Fetch workers allowed to run at once, counting those abandoned after
    /// a timeout but still blocked in the source.
    pub max_fetch_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("dpledger.db"),
            default_max_epsilon_per_job: 2.0,
            default_epsilon_allocation: 10.0,
            default_delta_allocation: 5e-5,
            histogram_max_categories: 100,
            fetch_timeout_ms: 30_000,
            max_fetch_workers: 32,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the TOML file (explicit path, else `DPLEDGER_CONFIG`),
    /// then environment overrides.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// # Errors
    /// Returns `ConfigError::Parse` on malformed TOML.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `DPLEDGER_*` overrides. Unparseable or non-positive values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn positive_f64(key: &str, raw: &str) -> Option<f64> {
            match raw.trim().parse::<f64>() {
                Ok(x) if x.is_finite() && x > 0.0 => Some(x),
                _ => {
                    tracing::warn!("Ignoring invalid {key}={raw}");
                    None
                }
            }
        }
        fn positive_u64(key: &str, raw: &str) -> Option<u64> {
            match raw.trim().parse::<u64>() {
                Ok(x) if x > 0 => Some(x),
                _ => {
                    tracing::warn!("Ignoring invalid {key}={raw}");
                    None
                }
            }
        }

        if let Some(v) = lookup("DPLEDGER_DB") {
            if !v.trim().is_empty() {
                self.database_path = PathBuf::from(v.trim());
            }
        }
        if let Some(x) = lookup("DPLEDGER_MAX_EPSILON_PER_JOB")
            .and_then(|v| positive_f64("DPLEDGER_MAX_EPSILON_PER_JOB", &v))
        {
            self.default_max_epsilon_per_job = x;
        }
        if let Some(x) = lookup("DPLEDGER_DEFAULT_EPSILON")
            .and_then(|v| positive_f64("DPLEDGER_DEFAULT_EPSILON", &v))
        {
            self.default_epsilon_allocation = x;
        }
        if let Some(x) = lookup("DPLEDGER_DEFAULT_DELTA")
            .and_then(|v| positive_f64("DPLEDGER_DEFAULT_DELTA", &v))
        {
            self.default_delta_allocation = x;
        }
        if let Some(x) = lookup("DPLEDGER_HISTOGRAM_MAX_CATEGORIES")
            .and_then(|v| positive_u64("DPLEDGER_HISTOGRAM_MAX_CATEGORIES", &v))
        {
            self.histogram_max_categories = usize::try_from(x).unwrap_or(usize::MAX);
        }
        if let Some(x) = lookup("DPLEDGER_FETCH_TIMEOUT_MS")
            .and_then(|v| positive_u64("DPLEDGER_FETCH_TIMEOUT_MS", &v))
        {
            self.fetch_timeout_ms = x;
        }
        if let Some(x) = lookup("DPLEDGER_MAX_FETCH_WORKERS")
            .and_then(|v| positive_u64("DPLEDGER_MAX_FETCH_WORKERS", &v))
        {
            self.max_fetch_workers = usize::try_from(x).unwrap_or(usize::MAX);
        }
    }

    /// # Errors
    /// Returns `ConfigError::Validation` describing the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, x: f64| {
            if x.is_finite() && x > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Validation(format!("{name} must be positive, got {x}")))
            }
        };
        positive("default-max-epsilon-per-job", self.default_max_epsilon_per_job)?;
        positive("default-epsilon-allocation", self.default_epsilon_allocation)?;
        if !(0.0..1.0).contains(&self.default_delta_allocation) {
            return Err(ConfigError::Validation(format!(
                "default-delta-allocation must be in [0, 1), got {}",
                self.default_delta_allocation
            )));
        }
        if self.histogram_max_categories == 0 {
            return Err(ConfigError::Validation(
                "histogram-max-categories must be greater than zero".into(),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "fetch-timeout-ms must be greater than zero".into(),
            ));
        }
        if self.max_fetch_workers == 0 {
            return Err(ConfigError::Validation(
                "max-fetch-workers must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

//! Layered configuration: a TOML file with `Default` fallback, overridable
//! by environment variables.
//!
//! Mirrors the `ConfigLoader` pattern used across this codebase: a trait
//! with a default implementation for any `DeserializeOwned` type, plus a
//! small set of named environment overrides applied after the file load.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,
    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value}")]
    InvalidEnvOverride {
        /// Environment variable name.
        var: String,
        /// Raw value that failed to parse.
        value: String,
    },
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for any `DeserializeOwned` type, following the
/// pattern used for this codebase's other config structs.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

fn default_module_lock_timeout_ms() -> u64 {
    crate::consts::DEFAULT_MODULE_LOCK_TIMEOUT.as_millis() as u64
}

fn default_commit_step_count() -> u32 {
    crate::consts::DEFAULT_COMMIT_STEP_COUNT
}

fn default_commit_step_sleep_ms() -> u64 {
    crate::consts::DEFAULT_COMMIT_STEP_SLEEP.as_millis() as u64
}

fn default_repo_root() -> String {
    "./modstore-data".to_string()
}

fn default_initial_segment_size() -> usize {
    crate::consts::DEFAULT_INITIAL_SEGMENT_SIZE
}

fn default_segment_growth() -> usize {
    crate::consts::DEFAULT_SEGMENT_GROWTH
}

/// Runtime configuration for an [`crate::lifecycle::Engine`].
///
/// Loaded from a TOML file with every field defaulted, then overridden by
/// the `MODSTORE_*` environment variables in [`Config::load_layered`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Root directory holding `data/{module}.{datastore}` files.
    pub repo_root: String,
    /// Absolute deadline, in milliseconds, for a single module lock acquisition.
    #[serde(default = "default_module_lock_timeout_ms")]
    pub module_lock_timeout_ms: u64,
    /// Number of retries while `applying_changes` blocks a commit.
    #[serde(default = "default_commit_step_count")]
    pub commit_step_count: u32,
    /// Sleep, in milliseconds, between `applying_changes` contention retries.
    #[serde(default = "default_commit_step_sleep_ms")]
    pub commit_step_sleep_ms: u64,
    /// Initial size, in bytes, of a freshly created segment.
    #[serde(default = "default_initial_segment_size")]
    pub initial_segment_size: usize,
    /// Growth increment, in bytes, applied when the segment must grow.
    #[serde(default = "default_segment_growth")]
    pub segment_growth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            module_lock_timeout_ms: default_module_lock_timeout_ms(),
            commit_step_count: default_commit_step_count(),
            commit_step_sleep_ms: default_commit_step_sleep_ms(),
            initial_segment_size: default_initial_segment_size(),
            segment_growth: default_segment_growth(),
        }
    }
}

impl Config {
    /// Module lock acquisition deadline as a [`Duration`].
    pub fn module_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.module_lock_timeout_ms)
    }

    /// Sleep between `applying_changes` retries as a [`Duration`].
    pub fn commit_step_sleep(&self) -> Duration {
        Duration::from_millis(self.commit_step_sleep_ms)
    }

    /// Validate the loaded configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo_root.is_empty() {
            return Err(ConfigError::ValidationError(
                "repo_root must not be empty".to_string(),
            ));
        }
        if self.module_lock_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "module_lock_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.commit_step_count == 0 {
            return Err(ConfigError::ValidationError(
                "commit_step_count must be > 0".to_string(),
            ));
        }
        if self.initial_segment_size < crate::consts::SHM_MIN_SIZE
            || self.initial_segment_size > crate::consts::SHM_MAX_SIZE
        {
            return Err(ConfigError::ValidationError(format!(
                "initial_segment_size={} out of range [{}, {}]",
                self.initial_segment_size,
                crate::consts::SHM_MIN_SIZE,
                crate::consts::SHM_MAX_SIZE
            )));
        }
        Ok(())
    }

    /// Load from `path` if it exists, falling back to [`Default`] otherwise,
    /// then apply `MODSTORE_*` environment overrides.
    pub fn load_layered(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = match Config::load(path) {
            Ok(cfg) => cfg,
            Err(ConfigError::FileNotFound) => Config::default(),
            Err(e) => return Err(e),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("MODSTORE_REPO_ROOT") {
            self.repo_root = v;
        }
        if let Ok(v) = std::env::var("MODSTORE_MODULE_LOCK_TIMEOUT_MS") {
            self.module_lock_timeout_ms = parse_env("MODSTORE_MODULE_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("MODSTORE_COMMIT_STEP_COUNT") {
            self.commit_step_count = parse_env("MODSTORE_COMMIT_STEP_COUNT", &v)?;
        }
        if let Ok(v) = std::env::var("MODSTORE_COMMIT_STEP_SLEEP_MS") {
            self.commit_step_sleep_ms = parse_env("MODSTORE_COMMIT_STEP_SLEEP_MS", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride {
            var: var.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = Config::load_layered(Path::new("/nonexistent/modstore.toml")).unwrap();
        assert_eq!(cfg.commit_step_count, default_commit_step_count());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "repo_root = \"/tmp/store\"").unwrap();
        file.flush().unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.repo_root, "/tmp/store");
        assert_eq!(cfg.commit_step_count, default_commit_step_count());
    }

    #[test]
    fn rejects_unknown_field() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "bogus_field = 1").unwrap();
        file.flush().unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn env_override_wins_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "commit_step_count = 7").unwrap();
        file.flush().unwrap();
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("MODSTORE_COMMIT_STEP_COUNT", "99");
        }
        let cfg = Config::load_layered(file.path()).unwrap();
        unsafe {
            std::env::remove_var("MODSTORE_COMMIT_STEP_COUNT");
        }
        assert_eq!(cfg.commit_step_count, 99);
    }
}

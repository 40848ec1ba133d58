//! Configuration management for bulkfetch
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use bulkfetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Concurrency: {}", config.engine.concurrency);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `BULKFETCH__<section>__<key>`
//!
//! Examples:
//! - `BULKFETCH__ENGINE__CONCURRENCY=8`
//! - `BULKFETCH__ENGINE__REQUEST_TIMEOUT=30s`
//! - `BULKFETCH__DOWNLOADS__MAX_IMAGES=0`
//!
//! The search password is only read from `BULKFETCH_SEARCH_PASSWORD`.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/bulkfetch.toml`.
//! This can be overridden using the `BULKFETCH_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::{ByteSize, HumanDuration};
pub use models::{ArchiveConfig, Config, DownloadsConfig, EngineConfig, SearchConfig};
pub use validation::ValidationError;

use thiserror::Error;

use crate::engine::{OrchestratorOptions, RequestOptions, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),

    #[error("Unknown archive '{0}'")]
    UnknownArchive(String),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Same layering as [`Config::load`] (`.env`, environment overrides and
    /// secrets), with `path` taking the place of `BULKFETCH_CONFIG`.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load(Some(path))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration as TOML. Secrets are never rendered.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn archive(&self, name: &str) -> Result<&ArchiveConfig, ConfigError> {
        self.archives
            .get(name)
            .ok_or_else(|| ConfigError::UnknownArchive(name.to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.engine.max_attempts,
            unit: self.engine.backoff_unit.as_duration(),
            rate_limit_cap: self.engine.rate_limit_cap,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            concurrency: self.engine.concurrency,
            ..OrchestratorOptions::default()
        }
    }

    /// Request options shared by all targets of a run
    pub fn request_options(&self, verify_tls: bool) -> RequestOptions {
        RequestOptions::builder()
            .timeout(self.engine.request_timeout.as_duration())
            .verify_tls(verify_tls)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[engine]\nconcurrency = 2\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.engine.concurrency, 2);
        assert_eq!(config.archives.len(), 2);
    }

    #[test]
    fn test_validation_catches_missing_archive() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[downloads]
default_archive = "nonexistent"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::UnknownArchive { .. })
        ));
    }

    #[test]
    fn test_engine_derivations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[engine]
concurrency = 6
max_attempts = 5
backoff_unit = "2s"
rate_limit_cap = 30
request_timeout = "45s"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.unit, Duration::from_secs(2));
        assert_eq!(policy.rate_limit_cap, 30);

        assert_eq!(config.orchestrator_options().concurrency, 6);

        let options = config.request_options(false);
        assert_eq!(options.timeout, Duration::from_secs(45));
        assert!(!options.verify_tls);
    }

    #[test]
    fn test_render_round_trips_through_toml() {
        let mut config = Config::default();
        config.search.password = Some("hunter2".to_string());

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[engine]"));
        assert!(rendered.contains("request_timeout = \"20s\""));
        assert!(!rendered.contains("hunter2"));

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("rendered.toml");
        fs::write(&config_path, rendered).unwrap();

        let reloaded = Config::load_from_path(config_path).unwrap();
        assert_eq!(reloaded.archives, config.archives);
    }

    #[test]
    fn test_unknown_archive_lookup() {
        let config = Config::default();
        assert!(config.archive("desuarchive").is_ok());
        assert!(matches!(
            config.archive("nowhere"),
            Err(ConfigError::UnknownArchive(name)) if name == "nowhere"
        ));
    }
}

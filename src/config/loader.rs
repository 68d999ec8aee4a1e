//! YAML configuration loader.

use std::path::Path;

use super::error::ConfigError;
use super::types::AppConfig;

/// Loader for configuration files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<AppConfig, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
        if config.database.trim().is_empty() {
            return Err(ConfigError::MissingField("database".into()));
        }

        if config.horizon_months == 0 {
            return Err(ConfigError::InvalidConfig(
                "horizon_months must be at least 1".into(),
            ));
        }

        let workers = &config.workers;
        if workers.concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers.concurrency cannot be zero".into(),
            ));
        }
        if workers.queues.total() == 0 {
            return Err(ConfigError::InvalidConfig(
                "at least one queue weight must be positive".into(),
            ));
        }
        if workers.poll_interval_ms == 0 || workers.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll and reap intervals must be positive".into(),
            ));
        }
        // A job outliving its lease would be delivered twice concurrently.
        if workers.job_timeout_secs == 0 || workers.job_timeout_secs >= workers.lease_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "job_timeout_secs ({}) must be positive and below lease_secs ({})",
                workers.job_timeout_secs, workers.lease_secs
            )));
        }

        if config.retry.max_delay < config.retry.base_delay {
            return Err(ConfigError::InvalidConfig(
                "retry.max_delay cannot be below retry.base_delay".into(),
            ));
        }

        config
            .sweep_schedule()
            .map_err(|e| ConfigError::InvalidConfig(format!("sweep: {}", e)))?;

        Ok(())
    }
}

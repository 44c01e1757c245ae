//! Configuration loading.
//!
//! Sources, later overriding earlier:
//! 1. `estate.yaml` in the current directory (if it exists)
//! 2. File given by the `path` argument
//! 3. File named by `ESTATE_CONFIG`
//! 4. Environment variables `ESTATE__<SECTION>__<KEY>`

use std::path::PathBuf;

use serde::Deserialize;

use crate::handler::DEFAULT_MAX_PRODUCE_DEPTH;
use crate::utils::retry::RetryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "estate.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ESTATE_CONFIG";
/// Environment variable prefix for configuration overrides.
pub const CONFIG_ENV_PREFIX: &str = "ESTATE";
/// Default period of the publication recovery sweep.
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub handler: HandlerConfig,
    pub feed: FeedConfig,
    /// Caller-side retry of version conflicts.
    pub retry: RetryConfig,
}

/// Where model documents come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// YAML model files, or directories of them.
    pub paths: Vec<PathBuf>,
    /// Register the models compiled into the crate (the account domain).
    pub builtin: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            builtin: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Bound on chains of produced commands within one unit of work.
    pub max_produce_depth: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_produce_depth: DEFAULT_MAX_PRODUCE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Back-off between redeliveries of an event whose handler failed.
    pub redelivery: RetryConfig,
    /// Period of the sweep that republishes events whose publication failed.
    pub recovery_interval_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            redelivery: RetryConfig::for_redelivery(),
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Load configuration from files and environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.paths")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Fast redelivery, no built-in models.
    pub fn for_test() -> Self {
        Self {
            models: ModelsConfig {
                paths: Vec::new(),
                builtin: false,
            },
            handler: HandlerConfig::default(),
            feed: FeedConfig {
                redelivery: RetryConfig::for_test(),
                recovery_interval_ms: 10,
            },
            retry: RetryConfig::for_test(),
        }
    }
}

#[cfg(test)]
mod tests;

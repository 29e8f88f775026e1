//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::ring::RingConfig;
use crate::rpc::{RpcClientConfig, RpcServerConfig};
use crate::transport::MessagingConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "hiverelay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "HIVERELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "HIVERELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "HIVERELAY_LOG";
/// Environment variable selecting log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "HIVERELAY_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Event bus fan-out settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Threads running deliveries.
    pub worker_threads: usize,
    pub ring: RingConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            ring: RingConfig::default(),
        }
    }
}

/// Delivery sink settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ring: RingConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub messaging: MessagingConfig,
    pub server: RpcServerConfig,
    pub client: RpcClientConfig,
    pub event_bus: EventBusConfig,
    pub delivery: DeliveryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `hiverelay.yaml` in the working directory, if present
    /// 2. `path`, if given
    /// 3. the file named by `HIVERELAY_CONFIG`, if set
    /// 4. `HIVERELAY__SECTION__KEY` environment variables
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
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Rejects settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rings = [
            ("server.ring", &self.server.ring),
            ("event_bus.ring", &self.event_bus.ring),
            ("delivery.ring", &self.delivery.ring),
        ];
        for (name, ring) in rings {
            if ring.size == 0 || !ring.size.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.size must be a power of two, got {}",
                    ring.size
                )));
            }
        }

        let threads = [
            ("server.consumer_threads", self.server.consumer_threads),
            ("server.worker_threads", self.server.worker_threads),
            ("client.response_consumer_threads", self.client.response_consumer_threads),
            ("event_bus.worker_threads", self.event_bus.worker_threads),
        ];
        for (name, count) in threads {
            if count == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        if self.client.ping.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "client.ping.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.messaging.request_topic.is_empty() {
            return Err(ConfigError::Invalid(
                "messaging.request_topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;

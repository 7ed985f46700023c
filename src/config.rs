//! Bus configuration: transport selection and connection settings.
//!
//! Loaded from a YAML file (path from `HOPLINE_CONFIG`, falling back to
//! `config.yaml` beside the binary) with environment variable overrides on
//! top. Every field has a default, so a missing file is not an error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Which transport backend to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Amqp,
    Memory,
}

/// AMQP connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub url: String,
    pub exchange: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "hopline.messages".to_string(),
        }
    }
}

/// Top-level bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    pub amqp: AmqpSettings,
    pub call_timeout_ms: Option<u64>,
}

impl BusConfig {
    /// Load configuration from the conventional locations, then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("HOPLINE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = if Path::new(&path).exists() {
            info!(path = %path, "Loading config");
            Self::from_file(&path)?
        } else {
            debug!(path = %path, "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HOPLINE_AMQP_URL") {
            self.amqp.url = url;
        }
        if let Ok(exchange) = std::env::var("HOPLINE_EXCHANGE") {
            self.amqp.exchange = exchange;
        }
        if let Ok(ms) = std::env::var("HOPLINE_CALL_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.call_timeout_ms = Some(ms);
            }
        }
    }

    /// The configured sync-send deadline, if any.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

//! Client configuration loading

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{ClientError, Result};

pub const DEFAULT_DISCOVERY_TOPIC: &str = "urd/discover";
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_RPC_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Settings for the discovery handshake, RPC calls and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    pub discovery_topic: Option<String>,
    pub discovery_timeout_secs: Option<f64>,
    pub rpc_timeout_secs: Option<f64>,
    pub subscription_buffer: Option<usize>,
}

impl ClientConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::load_from_str(&contents)
    }

    /// Parse either a full config file (`client:` section) or a bare client section.
    pub fn load_from_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(ClientConfig::default());
        }
        let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
        let config: ClientConfig = match value.get("client") {
            Some(section) => serde_yaml::from_value(section.clone())?,
            None if value.is_null() => ClientConfig::default(),
            None => serde_yaml::from_value(value)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_discovery_topic(mut self, topic: impl Into<String>) -> Self {
        self.discovery_topic = Some(topic.into());
        self
    }

    pub fn with_subscription_buffer(mut self, buffer: usize) -> Self {
        self.subscription_buffer = Some(buffer);
        self
    }

    /// Get discovery topic with default fallback
    pub fn discovery_topic(&self) -> &str {
        self.discovery_topic
            .as_deref()
            .unwrap_or(DEFAULT_DISCOVERY_TOPIC)
    }

    /// Get discovery timeout with default fallback
    pub fn discovery_timeout(&self) -> Duration {
        secs(self.discovery_timeout_secs, DEFAULT_DISCOVERY_TIMEOUT_SECS)
    }

    /// Get default RPC timeout with default fallback
    pub fn rpc_timeout(&self) -> Duration {
        secs(self.rpc_timeout_secs, DEFAULT_RPC_TIMEOUT_SECS)
    }

    /// Get subscription channel capacity with default fallback
    pub fn subscription_buffer(&self) -> usize {
        self.subscription_buffer
            .unwrap_or(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("rpc_timeout_secs", self.rpc_timeout_secs),
        ];
        for (name, value) in timeouts {
            if let Some(v) = value {
                if v <= 0.0 || Duration::try_from_secs_f64(v).is_err() {
                    return Err(ClientError::Config(format!(
                        "{} must be a positive, representable number of seconds, got {}",
                        name, v
                    )));
                }
            }
        }
        if self.subscription_buffer == Some(0) {
            return Err(ClientError::Config(
                "subscription_buffer must be at least 1".to_string(),
            ));
        }
        if self.discovery_topic.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ClientError::Config("discovery_topic must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Out-of-range values fall back to the default; `validate` rejects them on load.
fn secs(value: Option<f64>, default: f64) -> Duration {
    value
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

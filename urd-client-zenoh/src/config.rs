//! SDK configuration: client settings plus Zenoh session settings

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use urd_client::{ClientConfig, ClientError, Result};

const MODES: [&str; 3] = ["peer", "client", "router"];

/// How to open the Zenoh session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ZenohSettings {
    /// Zenoh json5 config file, loaded before the overrides below
    pub config_file: Option<PathBuf>,
    pub mode: Option<String>,
    #[serde(default)]
    pub connect: Vec<String>,
}

impl ZenohSettings {
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.connect.push(endpoint.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mode) = self.mode.as_deref() {
            if !MODES.contains(&mode) {
                return Err(ClientError::Config(format!(
                    "zenoh.mode must be one of {}, got '{}'",
                    MODES.join(", "),
                    mode
                )));
            }
        }
        Ok(())
    }

    /// Build the Zenoh session config.
    pub fn to_zenoh_config(&self) -> Result<zenoh::Config> {
        self.validate()?;

        let mut config = match &self.config_file {
            Some(path) => zenoh::Config::from_file(path).map_err(|e| {
                ClientError::Config(format!("Failed to load Zenoh config {}: {}", path.display(), e))
            })?,
            None => zenoh::Config::default(),
        };

        if let Some(mode) = &self.mode {
            insert_json5(&mut config, "mode", &serde_json::Value::from(mode.as_str()))?;
        }
        if !self.connect.is_empty() {
            insert_json5(
                &mut config,
                "connect/endpoints",
                &serde_json::Value::from(self.connect.clone()),
            )?;
        }
        Ok(config)
    }
}

fn insert_json5(config: &mut zenoh::Config, key: &str, value: &serde_json::Value) -> Result<()> {
    config
        .insert_json5(key, &value.to_string())
        .map_err(|e| ClientError::Config(format!("Invalid Zenoh setting '{}': {}", key, e)))
}

/// Full SDK configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub zenoh: ZenohSettings,
}

impl SdkConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(SdkConfig::default());
        }
        let config: SdkConfig = serde_yaml::from_str(contents)?;
        config.client.validate()?;
        config.zenoh.validate()?;
        Ok(config)
    }
}

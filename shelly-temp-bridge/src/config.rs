//! Configuration loading
//!
//! Handles:
//! - MQTT broker settings for the bus transport
//! - Logging level and optional log file
//! - One `[[device]]` section per monitored probe
//!
//! Device sections are kept as raw TOML tables here and only turned into
//! [`DeviceConfig`] by the supervisor, so one malformed section never takes
//! the others down with it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::BridgeError;

pub const CONFIG_ENV: &str = "SHELLY_BRIDGE_CONFIG";
pub const DEFAULT_CLOUD_ENDPOINT: &str = "https://api.ecowitt.net/api/v3/device/real_time";
/// Upper bound of the derived request timeout
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
    pub bridge: BridgeSettings,
    #[serde(rename = "device")]
    pub devices: Vec<toml::Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub service_prefix: String,
    /// Fixed timeout for every request; derived from each poll period when unset
    pub request_timeout_ms: Option<u64>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "shelly-temp-bridge".to_string(),
            keep_alive_secs: 30,
            topic_prefix: "shelly-bridge".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            service_prefix: "com.victronenergy.temperature".to_string(),
            request_timeout_ms: None,
        }
    }
}

impl BridgeSettings {
    /// Timeout for one device: the configured one, else 80% of its poll
    /// period capped at [`MAX_REQUEST_TIMEOUT_MS`]
    pub fn request_timeout(&self, poll_interval_ms: u64) -> Duration {
        let ms = self
            .request_timeout_ms
            .unwrap_or_else(|| (poll_interval_ms * 4 / 5).clamp(1, MAX_REQUEST_TIMEOUT_MS));
        Duration::from_millis(ms)
    }
}

/// One monitored device (immutable once loaded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub instance: u32,
    #[serde(default = "default_custom_name")]
    pub custom_name: String,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    /// `OnPremise` or `Cloud`
    pub access_type: String,
    #[serde(default)]
    pub on_premise: Option<OnPremiseConfig>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default = "default_temperature_type")]
    pub temperature_type: i64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Liveness report period, 0 disables it
    #[serde(default = "default_sign_of_life_minutes")]
    pub sign_of_life_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnPremiseConfig {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default = "default_cloud_endpoint")]
    pub endpoint: String,
    pub application_key: String,
    pub api_key: String,
    pub mac: String,
}

/// Where the reading lives in the device response.
///
/// Exactly one of `probe` and `key_path` must be set; `container` and
/// `field` only refine a probe selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub probe: Option<String>,
    pub container: Option<String>,
    pub field: Option<String>,
    pub key_path: Option<String>,
}

fn default_custom_name() -> String {
    "Shelly Uni Temp Sensor".to_string()
}

fn default_product_name() -> String {
    "Shelly Uni".to_string()
}

fn default_temperature_type() -> i64 {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_sign_of_life_minutes() -> u64 {
    5
}

fn default_cloud_endpoint() -> String {
    DEFAULT_CLOUD_ENDPOINT.to_string()
}

impl DeviceConfig {
    /// Parse one raw `[[device]]` section
    pub fn from_section(section: &toml::Table) -> Result<Self, BridgeError> {
        let config: DeviceConfig = toml::Value::Table(section.clone())
            .try_into()
            .map_err(|e| BridgeError::Configuration(format!("invalid device section: {e}")))?;

        if config.poll_interval_ms == 0 {
            return Err(BridgeError::Configuration(format!(
                "device {}: poll_interval_ms must be greater than zero",
                config.instance
            )));
        }
        Ok(config)
    }

    /// Bus service name, unique per device instance
    pub fn service_name(&self, prefix: &str) -> String {
        format!("{}.http_{:02}", prefix, self.instance)
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content).context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Load config from the first location that exists.
    ///
    /// A missing file is not an error: the bridge then starts with no devices.
    pub async fn load() -> Result<Self> {
        match Self::config_file_path() {
            Some(path) => Self::load_from(&path).await,
            None => {
                warn!("No configuration file found, using defaults (no devices)");
                Ok(Self::default())
            }
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// `$SHELLY_BRIDGE_CONFIG`, then `./config.toml`, then the OS config dir
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Some(local);
        }

        let mut path = dirs::config_dir()?;
        path.push("shelly-temp-bridge");
        path.push("config.toml");
        path.exists().then_some(path)
    }
}

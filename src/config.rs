//! Bridge configuration loading and validation
//!
//! One TOML document holding an `[mqtt]` section and any number of
//! `[[device]]` sections, parsed with `toml::from_str` and then validated
//! (local key length, recognized device model) with a hand-written
//! `ConfigError` enum.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::Backoff;
use crate::mqtt::MqttConfig;
use crate::transport::TransportConfig;
use crate::update_buffer::UpdateBufferConfig;

#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(toml::de::Error),
    InvalidLocalKey { device: String },
    UnknownModel { device: String, model: String },
    MissingMqtt,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(err) => write!(f, "failed to read config file: {err}"),
            ConfigError::Parse(err) => write!(f, "failed to parse config file: {err}"),
            ConfigError::InvalidLocalKey { device } => {
                write!(f, "device '{device}' has a key that is not exactly 16 bytes")
            }
            ConfigError::UnknownModel { device, model } => {
                write!(f, "device '{device}' selects unknown model '{model}'")
            }
            ConfigError::MissingMqtt => write!(f, "config is missing the [mqtt] section"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Read(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

fn default_port() -> u16 {
    6668
}
fn default_timeout() -> f64 {
    5.0
}
fn default_heartbeat_interval() -> f64 {
    15.0
}
fn default_state_refresh_interval() -> f64 {
    3600.0
}
fn default_debounce_updates() -> f64 {
    0.5
}
fn default_retries() -> u32 {
    5
}
fn default_retry_backoff() -> Vec<f64> {
    vec![5.0, 10.0, 30.0, 60.0]
}
fn default_connection_backoff() -> Vec<f64> {
    vec![0.0, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_discovery_prefix() -> String {
    "homeassistant".into()
}
fn default_prefix() -> String {
    "local-tuya".into()
}
fn default_mqtt_keepalive() -> f64 {
    60.0
}
fn default_mqtt_backoff() -> Vec<f64> {
    vec![0.0, 1.0, 5.0, 10.0, 30.0]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMqttConfig {
    pub hostname: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_mqtt_keepalive")]
    pub keepalive: f64,
    #[serde(default = "default_mqtt_backoff")]
    pub backoff: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDeviceConfig {
    pub name: String,
    pub id: String,
    pub model: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub key: String,
    #[serde(default = "default_connection_backoff")]
    pub connection_backoff: Vec<f64>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_state_refresh_interval")]
    pub state_refresh_interval: f64,
    #[serde(default = "default_debounce_updates")]
    pub debounce_updates: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub mqtt: Option<RawMqttConfig>,
    #[serde(default, rename = "device")]
    pub devices: Vec<RawDeviceConfig>,
}

/// A fully validated device's core configuration.
#[derive(Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub id: String,
    pub model: String,
    pub key: [u8; 16],
    pub transport: TransportConfig,
    pub heartbeat_interval: Duration,
    pub state_refresh_interval: Duration,
    pub update_buffer: UpdateBufferConfig,
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("model", &self.model)
            .field("key", &"<redacted>")
            .field("transport", &self.transport)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("state_refresh_interval", &self.state_refresh_interval)
            .field("update_buffer", &self.update_buffer)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig>,
}

const SUPPORTED_MODELS: &[&str] = &["meaco_dehumidifier"];

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mqtt_raw = raw.mqtt.ok_or(ConfigError::MissingMqtt)?;

        let mqtt = MqttConfig {
            hostname: mqtt_raw.hostname,
            port: mqtt_raw.port,
            username: mqtt_raw.username,
            password: mqtt_raw.password,
            discovery_prefix: mqtt_raw.discovery_prefix,
            prefix: mqtt_raw.prefix,
            keepalive: Duration::from_secs_f64(mqtt_raw.keepalive),
            backoff: Backoff::new(mqtt_raw.backoff),
        };

        let mut devices = Vec::with_capacity(raw.devices.len());
        for raw_device in raw.devices {
            devices.push(validate_device(raw_device)?);
        }

        Ok(BridgeConfig { mqtt, devices })
    }
}

fn validate_device(raw: RawDeviceConfig) -> Result<DeviceConfig, ConfigError> {
    if !SUPPORTED_MODELS.contains(&raw.model.as_str()) {
        return Err(ConfigError::UnknownModel {
            device: raw.id.clone(),
            model: raw.model,
        });
    }

    let key_bytes = raw.key.as_bytes();
    let key: [u8; 16] = key_bytes.try_into().map_err(|_| ConfigError::InvalidLocalKey { device: raw.id.clone() })?;

    Ok(DeviceConfig {
        name: raw.name,
        id: raw.id,
        model: raw.model,
        key,
        transport: TransportConfig {
            address: raw.address,
            port: raw.port,
            timeout: Duration::from_secs_f64(raw.timeout),
            backoff: Backoff::new(raw.connection_backoff),
        },
        heartbeat_interval: Duration::from_secs_f64(raw.heartbeat_interval),
        state_refresh_interval: Duration::from_secs_f64(raw.state_refresh_interval),
        update_buffer: UpdateBufferConfig {
            debounce: Duration::from_secs_f64(raw.debounce_updates),
            retries: raw.retries,
            retry_backoff: Backoff::new(raw.retry_backoff),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
[mqtt]
hostname = "broker.local"

[[device]]
name = "Study Dehumidifier"
id = "dehum1"
model = "meaco_dehumidifier"
address = "192.168.1.50"
key = "9efe59a10acd6ccf"
"#;

    #[test]
    fn loads_defaults_for_omitted_fields() {
        let config = BridgeConfig::from_str(VALID).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.prefix, "local-tuya");
        let device = &config.devices[0];
        assert_eq!(device.transport.port, 6668);
        assert_eq!(device.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(device.update_buffer.retries, 5);
    }

    #[test]
    fn rejects_a_key_that_is_not_16_bytes() {
        let bad = VALID.replace("9efe59a10acd6ccf", "tooshort");
        let err = BridgeConfig::from_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLocalKey { .. }));
    }

    #[test]
    fn rejects_an_unknown_model() {
        let bad = VALID.replace("meaco_dehumidifier", "some_other_device");
        let err = BridgeConfig::from_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel { .. }));
    }

    #[test]
    fn requires_an_mqtt_section() {
        let err = BridgeConfig::from_str("[[device]]\nname=\"x\"\nid=\"x\"\nmodel=\"meaco_dehumidifier\"\naddress=\"1.2.3.4\"\nkey=\"9efe59a10acd6ccf\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingMqtt));
    }
}

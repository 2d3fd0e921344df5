//! Configuration file loading
//!
//! Handles:
//! - TOML parsing of the `[software]`, `[device]`, `[mqtt]`, `[reconnect]` and `[[sensors]]` sections
//! - config path resolution (CLI argument, `SENSORLINK_CONFIG`, OS config dir)
//! - conversion into the entity model and runtime settings
//!
//! Durations are whole seconds. Structural checks are left to
//! `EntityModel::validate`, which runs before anything is scheduled.

use crate::error::{ConfigError, LoadError};
use crate::model::{Broker, Device, EntityModel, Sensor};
use crate::session::ReconnectPolicy;
use crate::settings::{Settings, DEFAULT_DISCOVERY_PREFIX};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "SENSORLINK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub software: SoftwareConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    pub refresh_period_s: u64,
    pub command_timeout_s: u64,
    pub discovery_prefix: String,
    pub base_prefix: String,
    pub retain_state: bool,
    pub shutdown_grace_s: u64,
    pub shell: String,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        let defaults = Settings::default();
        Self {
            refresh_period_s: defaults.refresh_period.as_secs(),
            command_timeout_s: defaults.command_timeout.as_secs(),
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            base_prefix: defaults.base_prefix,
            retain_state: defaults.retain_state,
            shutdown_grace_s: defaults.shutdown_grace.as_secs(),
            shell: defaults.shell,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Defaults to the host name
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)] // Never written back
    pub password: Option<String>,
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_timeout")]
    pub timeout_s: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_delay_s: policy.initial_delay.as_secs(),
            max_delay_s: policy.max_delay.as_secs(),
            jitter: policy.jitter,
            max_attempts: policy.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub command: String,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub icon: Option<String>,
    /// Parent devices; empty means the configured device
    #[serde(default)]
    pub devices: Vec<String>,
    pub interval_s: Option<u64>,
    pub timeout_s: Option<u64>,
}

impl AppConfig {
    /// Load config from a TOML file
    pub async fn load(path: &Path) -> Result<Self, LoadError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Pick the config file: explicit argument, then `SENSORLINK_CONFIG`, then the OS location
    pub fn resolve_path(arg: Option<String>) -> Result<PathBuf, LoadError> {
        if let Some(path) = arg.or_else(|| std::env::var(CONFIG_ENV_VAR).ok()) {
            return Ok(PathBuf::from(path));
        }
        Self::config_file_path()
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf, LoadError> {
        let mut path = dirs::config_dir().ok_or(LoadError::NoConfigDir)?;
        path.push("sensorlink");
        path.push("config.toml");
        Ok(path)
    }

    /// Build the entity model and runtime settings
    pub fn into_runtime(self) -> Result<(EntityModel, Settings), ConfigError> {
        let device_name = self.device.name.unwrap_or_else(local_hostname);
        let device = Device {
            name: device_name.clone(),
            manufacturer: self.device.manufacturer,
            model: self.device.model,
            serial_number: self.device.serial_number,
        };

        let qos = match self.mqtt.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            other => return Err(ConfigError::UnsupportedQos(other)),
        };
        let broker = Broker {
            host: self.mqtt.host,
            port: self.mqtt.port,
            username: self.mqtt.username,
            password: self.mqtt.password,
            client_id: self.mqtt.client_id,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            qos,
            operation_timeout: Duration::from_secs(self.mqtt.timeout_s),
        };

        let sensors = self
            .sensors
            .into_iter()
            .map(|s| Sensor {
                name: s.name,
                command: s.command,
                device_class: s.device_class,
                state_class: s.state_class,
                unit_of_measurement: s.unit_of_measurement,
                icon: s.icon,
                parents: if s.devices.is_empty() {
                    vec![device_name.clone()]
                } else {
                    s.devices
                },
                interval: s.interval_s.map(Duration::from_secs),
                timeout: s.timeout_s.map(Duration::from_secs),
            })
            .collect();

        let software = self.software;
        let settings = Settings {
            discovery_prefix: software.discovery_prefix,
            base_prefix: software.base_prefix,
            refresh_period: Duration::from_secs(software.refresh_period_s),
            command_timeout: Duration::from_secs(software.command_timeout_s),
            retain_state: software.retain_state,
            shutdown_grace: Duration::from_secs(software.shutdown_grace_s),
            shell: software.shell,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_secs(self.reconnect.initial_delay_s),
                max_delay: Duration::from_secs(self.reconnect.max_delay_s),
                jitter: self.reconnect.jitter,
                max_attempts: self.reconnect.max_attempts,
            },
        };

        Ok((EntityModel::new(device, broker, sensors), settings))
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

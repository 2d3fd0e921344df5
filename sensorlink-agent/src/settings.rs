//! Runtime settings shared by the composer and the scheduler

use crate::error::ConfigError;
use crate::model::Sensor;
use crate::session::ReconnectPolicy;
use std::time::Duration;

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// First segment of every discovery topic
    pub discovery_prefix: String,
    /// First segment of state and availability topics, omitted when empty
    pub base_prefix: String,
    /// Poll period for sensors without their own interval
    pub refresh_period: Duration,
    /// Command timeout for sensors without their own timeout
    pub command_timeout: Duration,
    pub retain_state: bool,
    /// How long in-flight polls may run after a stop request
    pub shutdown_grace: Duration,
    /// Shell used to run sensor commands (`{shell} -c {command}`)
    pub shell: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
            base_prefix: String::new(),
            refresh_period: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
            retain_state: false,
            shutdown_grace: Duration::from_secs(5),
            shell: "sh".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Settings {
    pub fn poll_interval(&self, sensor: &Sensor) -> Duration {
        sensor.interval.unwrap_or(self.refresh_period)
    }

    pub fn command_timeout_for(&self, sensor: &Sensor) -> Duration {
        sensor.timeout.unwrap_or(self.command_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptySetting("discovery_prefix"));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::EmptySetting("shell"));
        }
        for (field, value) in [
            ("refresh period", self.refresh_period),
            ("command timeout", self.command_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    owner: "settings".to_string(),
                    field,
                });
            }
        }
        self.reconnect.validate()
    }
}

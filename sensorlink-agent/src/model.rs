//! Entity model: one device, one broker descriptor and the sensors published under it
//!
//! The model is built once at startup and is read-only afterwards, so it can be
//! shared between poll tasks behind an `Arc` without synchronization.

use crate::discovery::topic_id;
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Smallest keep-alive the session accepts.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// MQTT encodes the keep-alive as 16-bit seconds
pub const MAX_KEEP_ALIVE: Duration = Duration::from_secs(u16::MAX as u64);

/// Identity the published sensors are grouped under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: None,
            model: None,
            serial_number: None,
        }
    }
}

/// Broker connection target and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Generated from the device name when absent
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    pub qos: QoS,
    /// Upper bound for each network operation (handshake, publish, close)
    pub operation_timeout: Duration,
}

impl Broker {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            client_id: None,
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtLeastOnce,
            operation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() || self.host.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidBrokerHost(self.host.clone()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidBrokerPort);
        }
        if let Some(id) = &self.client_id {
            if id.is_empty() || id.starts_with(char::is_whitespace) {
                return Err(ConfigError::InvalidClientId(id.clone()));
            }
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::PasswordWithoutUsername);
        }
        if self.keep_alive < MIN_KEEP_ALIVE {
            return Err(ConfigError::KeepAliveTooShort {
                min: MIN_KEEP_ALIVE.as_secs(),
                got: self.keep_alive.as_secs(),
            });
        }
        if self.keep_alive > MAX_KEEP_ALIVE {
            return Err(ConfigError::KeepAliveTooLong {
                max: MAX_KEEP_ALIVE.as_secs(),
                got: self.keep_alive.as_secs(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                owner: "broker".to_string(),
                field: "operation timeout",
            });
        }
        Ok(())
    }
}

/// One pollable metric backed by a shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sensor {
    pub name: String,
    pub command: String,
    pub device_class: Option<String>,
    pub state_class: Option<String>,
    pub unit_of_measurement: Option<String>,
    pub icon: Option<String>,
    /// Names of the devices this sensor is published under, in order
    pub parents: Vec<String>,
    /// Overrides the global refresh period
    pub interval: Option<Duration>,
    /// Overrides the global command timeout
    pub timeout: Option<Duration>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, command: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            device_class: None,
            state_class: None,
            unit_of_measurement: None,
            icon: None,
            parents: vec![parent.into()],
            interval: None,
            timeout: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn with_state_class(mut self, class: impl Into<String>) -> Self {
        self.state_class = Some(class.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One poll result, discarded once published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub sensor_name: String,
    pub raw_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the pipeline needs to know about what to publish and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityModel {
    pub device: Device,
    pub broker: Broker,
    pub sensors: Vec<Sensor>,
}

impl EntityModel {
    pub fn new(device: Device, broker: Broker, sensors: Vec<Sensor>) -> Self {
        Self { device, broker, sensors }
    }

    /// Look up a configured device by name
    pub fn device(&self, name: &str) -> Option<&Device> {
        (self.device.name == name).then_some(&self.device)
    }

    /// Devices a sensor is published under, in configuration order
    pub fn parents_of<'a>(&'a self, sensor: &'a Sensor) -> impl Iterator<Item = &'a Device> + 'a {
        sensor.parents.iter().filter_map(move |name| self.device(name))
    }

    /// Check every invariant of the model, stopping at the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::EmptyDeviceName);
        }
        self.broker.validate()?;

        // Per parent device: configured names, and topic id -> first sensor name
        let mut names: HashSet<(&str, &str)> = HashSet::new();
        let mut ids: HashMap<(&str, String), &str> = HashMap::new();

        for (index, sensor) in self.sensors.iter().enumerate() {
            if sensor.name.trim().is_empty() {
                return Err(ConfigError::EmptySensorName { index });
            }
            let sensor_id = topic_id(&sensor.name);
            if sensor.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand {
                    sensor: sensor.name.clone(),
                });
            }
            if sensor.parents.is_empty() {
                return Err(ConfigError::NoParentDevice {
                    sensor: sensor.name.clone(),
                });
            }
            for (field, value) in [("interval", sensor.interval), ("timeout", sensor.timeout)] {
                if value.is_some_and(|d| d.is_zero()) {
                    return Err(ConfigError::ZeroDuration {
                        owner: sensor.name.clone(),
                        field,
                    });
                }
            }

            let mut parents = HashSet::new();
            for parent in &sensor.parents {
                if self.device(parent).is_none() {
                    return Err(ConfigError::UnknownDevice {
                        sensor: sensor.name.clone(),
                        device: parent.clone(),
                    });
                }
                if !parents.insert(parent.as_str()) {
                    return Err(ConfigError::DuplicateParent {
                        sensor: sensor.name.clone(),
                        device: parent.clone(),
                    });
                }
                if !names.insert((parent.as_str(), sensor.name.as_str())) {
                    return Err(ConfigError::DuplicateSensor {
                        device: parent.clone(),
                        name: sensor.name.clone(),
                    });
                }
                if let Some(first) = ids.insert((parent.as_str(), sensor_id.clone()), &sensor.name) {
                    return Err(ConfigError::TopicIdCollision {
                        device: parent.clone(),
                        first: first.to_string(),
                        second: sensor.name.clone(),
                        topic_id: sensor_id,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attic() -> EntityModel {
        EntityModel::new(
            Device::new("attic"),
            Broker::new("localhost", 1883),
            vec![
                Sensor::new("temp", "echo 21.5", "attic").with_unit("°C"),
                Sensor::new("humidity", "echo 40", "attic"),
            ],
        )
    }

    #[test]
    fn test_valid_model() {
        assert_eq!(attic().validate(), Ok(()));
    }

    #[test]
    fn test_model_without_sensors_is_valid() {
        let mut model = attic();
        model.sensors.clear();
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_duplicate_sensor_names() {
        let mut model = attic();
        model.sensors.push(Sensor::new("temp", "echo 0", "attic"));

        assert_eq!(
            model.validate(),
            Err(ConfigError::DuplicateSensor {
                device: "attic".to_string(),
                name: "temp".to_string(),
            })
        );
    }

    #[test]
    fn test_distinct_names_with_same_slug() {
        let mut model = attic();
        model.sensors = vec![
            Sensor::new("a.b", "echo 1", "attic"),
            Sensor::new("a b", "echo 2", "attic"),
            Sensor::new("a_b", "echo 3", "attic"),
            Sensor::new("CPU Temp", "echo 4", "attic"),
            Sensor::new("cpu_temp", "echo 5", "attic"),
        ];
        assert_eq!(model.validate(), Ok(()));
    }

    #[test]
    fn test_non_latin_names() {
        let model = EntityModel::new(
            Device::new("屋根裏"),
            Broker::new("localhost", 1883),
            vec![
                Sensor::new("温度", "echo 21.5", "屋根裏"),
                Sensor::new("湿度", "echo 40", "屋根裏"),
            ],
        );
        assert_eq!(model.validate(), Ok(()));
    }

    #[test]
    fn test_empty_command() {
        let mut model = attic();
        model.sensors[1].command = "   ".to_string();
        assert_eq!(
            model.validate(),
            Err(ConfigError::EmptyCommand { sensor: "humidity".to_string() })
        );
    }

    #[test]
    fn test_sensor_without_parent() {
        let mut model = attic();
        model.sensors[0].parents.clear();
        assert!(matches!(model.validate(), Err(ConfigError::NoParentDevice { .. })));
    }

    #[test]
    fn test_unknown_and_repeated_parents() {
        let mut model = attic();
        model.sensors[0].parents = vec!["cellar".to_string()];
        assert!(matches!(model.validate(), Err(ConfigError::UnknownDevice { .. })));

        model.sensors[0].parents = vec!["attic".to_string(), "attic".to_string()];
        assert!(matches!(model.validate(), Err(ConfigError::DuplicateParent { .. })));
    }

    #[test]
    fn test_broker_checks() {
        let mut model = attic();
        model.broker.host = "bad host".to_string();
        assert!(matches!(model.validate(), Err(ConfigError::InvalidBrokerHost(_))));

        let mut model = attic();
        model.broker.port = 0;
        assert_eq!(model.validate(), Err(ConfigError::InvalidBrokerPort));

        let mut model = attic();
        model.broker.password = Some("secret".to_string());
        assert_eq!(model.validate(), Err(ConfigError::PasswordWithoutUsername));

        let mut model = attic();
        model.broker.keep_alive = Duration::from_secs(2);
        assert!(matches!(model.validate(), Err(ConfigError::KeepAliveTooShort { .. })));

        let mut model = attic();
        model.broker.keep_alive = Duration::from_secs(70_000);
        assert!(matches!(model.validate(), Err(ConfigError::KeepAliveTooLong { max: 65535, .. })));

        let mut model = attic();
        model.broker.keep_alive = MAX_KEEP_ALIVE;
        assert!(model.validate().is_ok());

        let mut model = attic();
        model.broker.client_id = Some(" padded".to_string());
        assert!(matches!(model.validate(), Err(ConfigError::InvalidClientId(_))));
    }

    #[test]
    fn test_anonymous_and_authenticated_brokers() {
        let mut model = attic();
        model.broker = Broker::new("mqtt.lan", 8883).with_credentials("ha", Some("pw".to_string()));
        assert!(model.validate().is_ok());

        model.broker = Broker::new("mqtt.lan", 8883).with_credentials("ha", None);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut model = attic();
        model.sensors[0].interval = Some(Duration::ZERO);
        assert!(matches!(model.validate(), Err(ConfigError::ZeroDuration { field: "interval", .. })));
    }

    #[test]
    fn test_parents_of() {
        let model = attic();
        let parents: Vec<_> = model.parents_of(&model.sensors[0]).map(|d| d.name.as_str()).collect();
        assert_eq!(parents, vec!["attic"]);
    }
}

//! Home Assistant discovery composition
//!
//! Builds, without any I/O:
//! - the retained discovery topic and JSON payload of a sensor
//! - the state topic its readings are published to
//! - the availability topic of its device
//!
//! Topics are derived from topic ids of the device and sensor names, so the
//! same configuration always yields byte-identical messages across restarts and
//! the consumer replaces the entity instead of registering a new one.

use crate::model::{Device, Sensor};
use crate::settings::Settings;
use crate::{SOFTWARE_NAME, SOFTWARE_VERSION};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Discovery topic and payload for one sensor under one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

/// Topic-safe id: lowercase, `[a-z0-9_-]`, other runs collapsed into one `_`
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    out.trim_matches('_').to_string()
}

/// Topic segment for a configured name, never empty.
///
/// Names that are already topic-safe are used as is. Any other name gets
/// its slug plus the first 8 hex digits of its SHA-256, so distinct names
/// (`a.b`, `a b`, `温度`) never map to the same segment.
pub fn topic_id(name: &str) -> String {
    let base = slug(name);
    if base == name {
        return base;
    }

    let digest = Sha256::digest(name.as_bytes());
    let suffix = hex::encode(&digest[..4]);
    if base.is_empty() {
        suffix
    } else {
        format!("{}_{}", base, suffix)
    }
}

fn join_topic(prefix: &str, rest: &[&str]) -> String {
    let prefix = prefix.trim_matches('/');
    let mut parts = Vec::with_capacity(rest.len() + 1);
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    parts.extend_from_slice(rest);
    parts.join("/")
}

/// `{discovery_prefix}/sensor/{device}/{sensor}/config`
pub fn discovery_topic(settings: &Settings, device: &Device, sensor: &Sensor) -> String {
    join_topic(
        &settings.discovery_prefix,
        &["sensor", &topic_id(&device.name), &topic_id(&sensor.name), "config"],
    )
}

/// `{base_prefix}/{device}/{sensor}/state`
pub fn state_topic(settings: &Settings, device: &Device, sensor: &Sensor) -> String {
    join_topic(
        &settings.base_prefix,
        &[&topic_id(&device.name), &topic_id(&sensor.name), "state"],
    )
}

/// `{base_prefix}/{device}/availability`
pub fn availability_topic(settings: &Settings, device: &Device) -> String {
    join_topic(&settings.base_prefix, &[&topic_id(&device.name), "availability"])
}

pub fn unique_id(device: &Device, sensor: &Sensor) -> String {
    format!("{}_{}", topic_id(&device.name), topic_id(&sensor.name))
}

fn insert_present(map: &mut Map<String, Value>, key: &str, value: Option<&String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), Value::String(value.clone()));
    }
}

fn device_block(device: &Device) -> Value {
    let mut block = Map::new();
    block.insert("identifiers".to_string(), json!([format!("sensorlink_{}", topic_id(&device.name))]));
    block.insert("name".to_string(), Value::String(device.name.clone()));
    insert_present(&mut block, "manufacturer", device.manufacturer.as_ref());
    insert_present(&mut block, "model", device.model.as_ref());
    insert_present(&mut block, "serial_number", device.serial_number.as_ref());
    Value::Object(block)
}

/// Compose the discovery message of `sensor` as published under `device`.
pub fn compose(settings: &Settings, device: &Device, sensor: &Sensor) -> DiscoveryMessage {
    let id = unique_id(device, sensor);

    let mut payload = Map::new();
    payload.insert("name".to_string(), Value::String(sensor.name.clone()));
    payload.insert("unique_id".to_string(), Value::String(id.clone()));
    payload.insert("object_id".to_string(), Value::String(id));
    payload.insert(
        "state_topic".to_string(),
        Value::String(state_topic(settings, device, sensor)),
    );
    insert_present(&mut payload, "device_class", sensor.device_class.as_ref());
    insert_present(&mut payload, "state_class", sensor.state_class.as_ref());
    insert_present(&mut payload, "unit_of_measurement", sensor.unit_of_measurement.as_ref());
    insert_present(&mut payload, "icon", sensor.icon.as_ref());
    payload.insert(
        "availability_topic".to_string(),
        Value::String(availability_topic(settings, device)),
    );
    payload.insert("device".to_string(), device_block(device));
    payload.insert(
        "origin".to_string(),
        json!({ "name": SOFTWARE_NAME, "sw_version": SOFTWARE_VERSION }),
    );

    DiscoveryMessage {
        topic: discovery_topic(settings, device, sensor),
        // Map keys are kept sorted, so the rendering is stable
        payload: Value::Object(payload).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp() -> Sensor {
        Sensor::new("temp", "echo 21.5", "attic").with_unit("°C")
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("attic"), "attic");
        assert_eq!(slug("CPU Temp"), "cpu_temp");
        assert_eq!(slug("  disk /var (used %) "), "disk_var_used");
        assert_eq!(slug("load-1m"), "load-1m");
        assert_eq!(slug("température"), "temp_rature");
        assert_eq!(slug("+#/"), "");
    }

    #[test]
    fn test_topic_id() {
        assert_eq!(topic_id("attic"), "attic");
        assert_eq!(topic_id("load-1m"), "load-1m");

        let dotted = topic_id("a.b");
        let spaced = topic_id("a b");
        assert!(dotted.starts_with("a_b_"));
        assert!(spaced.starts_with("a_b_"));
        assert_ne!(dotted, spaced);
        assert_ne!(dotted, topic_id("a_b"));
        assert_ne!(topic_id("CPU Temp"), topic_id("cpu_temp"));

        let kanji = topic_id("温度");
        assert_eq!(kanji.len(), 8);
        assert!(kanji.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(kanji, topic_id("湿度"));

        // Stable across calls and runs
        assert_eq!(topic_id("温度"), kanji);
        assert_eq!(topic_id("a.b"), dotted);
    }

    #[test]
    fn test_non_latin_topics() {
        let device = Device::new("attic");
        let sensor = Sensor::new("温度", "echo 21.5", "attic");
        let id = topic_id("温度");

        let message = compose(&Settings::default(), &device, &sensor);
        let payload: Value = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(message.topic, format!("homeassistant/sensor/attic/{}/config", id));
        assert_eq!(payload["name"], "温度");
        assert_eq!(payload["unique_id"], format!("attic_{}", id));
        assert_eq!(payload["state_topic"], format!("attic/{}/state", id));
    }

    #[test]
    fn test_topics() {
        let settings = Settings::default();
        let device = Device::new("attic");

        assert_eq!(
            discovery_topic(&settings, &device, &temp()),
            "homeassistant/sensor/attic/temp/config"
        );
        assert_eq!(state_topic(&settings, &device, &temp()), "attic/temp/state");
        assert_eq!(availability_topic(&settings, &device), "attic/availability");

        let prefixed = Settings {
            base_prefix: "sensorlink/".to_string(),
            ..Settings::default()
        };
        assert_eq!(state_topic(&prefixed, &device, &temp()), "sensorlink/attic/temp/state");
    }

    #[test]
    fn test_payload_fields() {
        let message = compose(&Settings::default(), &Device::new("attic"), &temp());
        let payload: Value = serde_json::from_str(&message.payload).unwrap();

        assert_eq!(payload["name"], "temp");
        assert_eq!(payload["unique_id"], "attic_temp");
        assert_eq!(payload["state_topic"], "attic/temp/state");
        assert_eq!(payload["unit_of_measurement"], "°C");
        assert_eq!(payload["availability_topic"], "attic/availability");
        assert_eq!(payload["device"]["name"], "attic");
        assert_eq!(payload["origin"]["name"], SOFTWARE_NAME);

        // Unset classification fields are absent, not empty strings
        assert!(payload.get("device_class").is_none());
        assert!(payload.get("state_class").is_none());
        assert!(payload.get("icon").is_none());
        assert!(payload["device"].get("manufacturer").is_none());
    }

    #[test]
    fn test_empty_strings_are_omitted() {
        let mut sensor = temp();
        sensor.device_class = Some(String::new());
        sensor.state_class = Some("measurement".to_string());

        let message = compose(&Settings::default(), &Device::new("attic"), &sensor);
        let payload: Value = serde_json::from_str(&message.payload).unwrap();
        assert!(payload.get("device_class").is_none());
        assert_eq!(payload["state_class"], "measurement");
    }

    #[test]
    fn test_device_details() {
        let device = Device {
            manufacturer: Some("Raspberry Pi".to_string()),
            model: Some("4B".to_string()),
            serial_number: Some("00000000abcd".to_string()),
            ..Device::new("Attic Pi")
        };
        let message = compose(&Settings::default(), &device, &temp());
        let payload: Value = serde_json::from_str(&message.payload).unwrap();

        let device_id = topic_id("Attic Pi");
        assert!(device_id.starts_with("attic_pi_"));
        assert_eq!(message.topic, format!("homeassistant/sensor/{}/temp/config", device_id));
        assert_eq!(payload["device"]["identifiers"][0], format!("sensorlink_{}", device_id));
        assert_eq!(payload["device"]["model"], "4B");
        assert_eq!(payload["device"]["serial_number"], "00000000abcd");
    }

    #[test]
    fn test_composition_is_deterministic() {
        let settings = Settings::default();
        let device = Device::new("attic");
        let sensor = temp().with_device_class("temperature").with_state_class("measurement");

        let first = compose(&settings, &device, &sensor);
        let second = compose(&settings.clone(), &device.clone(), &sensor.clone());
        assert_eq!(first, second);
        assert_eq!(first.payload.as_bytes(), second.payload.as_bytes());
    }
}

/*!
Test harness for the sensor pipeline

Facilitates end-to-end tests with:
- ready-made entity models and fast settings
- waits on the mock transport instead of fixed sleeps
- assertions on discovery payload fields
*/

use anyhow::Result;
use crate::mqtt_stub::{MockMessage, MockTransport};
use sensorlink_agent::discovery;
use sensorlink_agent::session::ReconnectPolicy;
use sensorlink_agent::{scheduler, Broker, ConfigError, Device, EntityModel, RunHandle, Sensor, Settings};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// How often waits re-check the transport
const POLL_STEP: Duration = Duration::from_millis(10);

pub struct TestHarness {
    pub transport: MockTransport,
    pub settings: Settings,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Logging for tests

        Self {
            transport: MockTransport::new(),
            settings: Self::fast_settings(),
        }
    }

    /// Short periods so a test sees several poll cycles in well under a second
    pub fn fast_settings() -> Settings {
        Settings {
            refresh_period: Duration::from_millis(50),
            command_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(80),
                jitter: 0.0,
                max_attempts: None,
            },
            ..Settings::default()
        }
    }

    pub fn broker() -> Broker {
        let mut broker = Broker::new("broker.test", 1883);
        broker.operation_timeout = Duration::from_secs(1);
        broker
    }

    /// Device "attic" with an `echo`-backed temperature sensor
    pub fn attic_model() -> EntityModel {
        let temp = Sensor::new("temp", "echo 21.5", "attic")
            .with_unit("°C")
            .with_device_class("temperature")
            .with_state_class("measurement");
        EntityModel::new(Device::new("attic"), Self::broker(), vec![temp])
    }

    pub fn model_with(device: &str, sensors: Vec<Sensor>) -> EntityModel {
        EntityModel::new(Device::new(device), Self::broker(), sensors)
    }

    /// Start the scheduler on a clone of the harness transport
    pub fn start(&self, model: EntityModel) -> Result<RunHandle<MockTransport>, ConfigError> {
        scheduler::start(model, self.settings.clone(), self.transport.clone())
    }

    pub fn discovery_topic(&self, device: &str, sensor: &str) -> String {
        discovery::discovery_topic(&self.settings, &Device::new(device), &Sensor::new(sensor, "true", device))
    }

    pub fn state_topic(&self, device: &str, sensor: &str) -> String {
        discovery::state_topic(&self.settings, &Device::new(device), &Sensor::new(sensor, "true", device))
    }

    pub fn availability_topic(&self, device: &str) -> String {
        discovery::availability_topic(&self.settings, &Device::new(device))
    }

    /// Wait until at least `count` messages were published on `topic`
    pub async fn wait_for_count(&self, topic: &str, count: usize, timeout_ms: u64) -> Vec<MockMessage> {
        let start = std::time::Instant::now();

        loop {
            let messages = self.transport.messages_on(topic);
            if messages.len() >= count || start.elapsed() >= Duration::from_millis(timeout_ms) {
                if messages.len() < count {
                    log::warn!("Timeout waiting for {} messages on {} (got {})", count, topic, messages.len());
                }
                return messages;
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    /// Wait for a JSON message on a topic
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        if self.wait_for_count(topic, 1, timeout_ms).await.is_empty() {
            return Ok(None);
        }
        self.transport.last_json_value(topic)
    }

    /// Wait until `check` holds, returning whether it did in time
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut check: F) -> bool
    where
        F: FnMut(&MockTransport) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if check(&self.transport) {
                return true;
            }
            tokio::time::sleep(POLL_STEP).await;
        }
        check(&self.transport)
    }

    /// Assert a field of the latest JSON message has a given value
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.transport.last_json_value(topic)? else {
            anyhow::bail!("No message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in {}", field_path, topic),
        }
    }

    pub fn assert_field_absent(&self, topic: &str, field_path: &str) -> Result<()> {
        let Some(msg) = self.transport.last_json_value(topic)? else {
            anyhow::bail!("No message on {}", topic);
        };
        if get_nested_field(&msg, field_path).is_some() {
            anyhow::bail!("Field '{}' unexpectedly present in {}", field_path, topic);
        }
        Ok(())
    }

    /// Stats on collected messages
    pub fn get_stats(&self) -> TestStats {
        let messages = self.transport.published();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Follow a dotted path (`device.name`) through nested objects
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}

impl TestStats {
    pub fn count(&self, topic: &str) -> usize {
        self.topic_counts.get(topic).copied().unwrap_or(0)
    }

    pub fn print(&self) {
        println!("Test statistics:");
        println!("  Total messages: {}", self.total_messages);
        for (topic, count) in &self.topic_counts {
            println!("    {}: {} messages", topic, count);
        }
    }
}

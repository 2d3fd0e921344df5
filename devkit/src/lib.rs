/*!
# SensorLink DevKit - test doubles for the sensor pipeline

Lets the scheduler and session run end to end without a broker:
- `MockTransport`: scriptable MQTT transport recording every message
- `TestHarness`: fixtures, waits and JSON assertions over what was published
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockTransport};
pub use test_utils::{TestHarness, TestStats};

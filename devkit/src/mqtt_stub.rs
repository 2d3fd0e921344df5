/*!
Mock MQTT transport for running the pipeline without a broker

Records every message the session sends and lets tests script failures:
broker outages, refused connections, broken sends and keepalives.
Clones share the same state, so a test keeps one clone while the
scheduler owns another.
*/

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::QoS;
use sensorlink_agent::session::{Handshake, MqttTransport};
use sensorlink_agent::TransportError;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

#[derive(Debug, Default)]
struct MockState {
    messages: Vec<MockMessage>,
    connected: bool,
    qos: Option<QoS>,
    last_handshake: Option<Handshake>,
    broker_down: bool,
    reject_credentials: bool,
    failing_connects: u32,
    failing_sends: u32,
    failing_keepalives: u32,
    opens: u32,
    handshakes: u32,
    keepalives: u32,
    closes: u32,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded messages
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse every connection while down; an open session breaks on its next operation.
    pub fn set_broker_down(&self, down: bool) {
        self.lock().broker_down = down;
        log::info!("[MOCK] broker {}", if down { "down" } else { "up" });
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.lock().failing_sends = count;
    }

    pub fn fail_next_keepalives(&self, count: u32) {
        self.lock().failing_keepalives = count;
    }

    /// Answer handshakes with "not authorized"
    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn handshakes(&self) -> u32 {
        self.lock().handshakes
    }

    pub fn keepalives(&self) -> u32 {
        self.lock().keepalives
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    pub fn last_handshake(&self) -> Option<Handshake> {
        self.lock().last_handshake.clone()
    }

    /// Every message accepted so far, in send order
    pub fn published(&self) -> Vec<MockMessage> {
        self.lock().messages.clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<MockMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse the last message of a topic as JSON
    pub fn last_json_on<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.messages_on(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn last_json_value(&self, topic: &str) -> Result<Option<Value>> {
        self.last_json_on(topic)
    }

    pub fn clear(&self) {
        self.lock().messages.clear();
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn open(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.opens += 1;
        state.connected = false;

        if state.broker_down {
            return Err(TransportError::Connection(format!("{}:{} unreachable", host, port)));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn handshake(&mut self, handshake: &Handshake) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.handshakes += 1;
        state.last_handshake = Some(handshake.clone());

        if state.reject_credentials {
            return Err(TransportError::Rejected("NotAuthorized".to_string()));
        }
        state.connected = true;
        state.qos = Some(handshake.qos);
        log::info!("[MOCK] session opened for {}", handshake.client_id);
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.broker_down {
            state.connected = false;
            return Err(TransportError::Connection("connection reset".to_string()));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            state.connected = false;
            return Err(TransportError::Connection("broken pipe".to_string()));
        }

        let qos = state.qos.unwrap_or(QoS::AtMostOnce);
        state.messages.push(MockMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        log::info!("[MOCK] published to {}: {} bytes", topic, payload.len());
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.keepalives += 1;
        if state.broker_down || state.failing_keepalives > 0 {
            state.failing_keepalives = state.failing_keepalives.saturating_sub(1);
            state.connected = false;
            return Err(TransportError::Timeout(std::time::Duration::from_secs(1)));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closes += 1;
        state.connected = false;
        Ok(())
    }
}

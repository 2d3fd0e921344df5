//! MQTT client collaborator
//!
//! The session manager only talks to the broker through [`MqttTransport`]:
//! open, handshake, send, keepalive and close. [`RumqttTransport`] implements
//! it on top of `rumqttc`, driving the client's event loop itself so every
//! network operation completes (or fails) inside the call that started it.

use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError as MqttConnectionError, Event, EventLoop, Incoming, LastWill,
    MqttOptions, Outgoing, QoS,
};
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// Parameters of the MQTT CONNECT exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub last_will: Option<Will>,
    pub qos: QoS,
    /// Bound on the handshake and on every later operation
    pub timeout: Duration,
}

/// Message the broker publishes on our behalf if the session dies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[async_trait]
pub trait MqttTransport: Send + 'static {
    /// Prepare a transport towards `host:port`, dropping any previous one.
    async fn open(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Perform the CONNECT/CONNACK exchange on the opened transport.
    async fn handshake(&mut self, handshake: &Handshake) -> Result<(), TransportError>;

    /// Send one message and wait until it is written (QoS 0) or acknowledged (QoS 1).
    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError>;

    /// Service keepalive: emit a ping when due and consume the broker's answers.
    async fn keepalive(&mut self) -> Result<(), TransportError>;

    /// Graceful teardown; a no-op when nothing is open.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// `rumqttc`-backed transport
pub struct RumqttTransport {
    target: Option<(String, u16)>,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
    qos: QoS,
    op_timeout: Duration,
    /// How long a keepalive call listens to the connection
    drain_window: Duration,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self {
            target: None,
            client: None,
            eventloop: None,
            qos: QoS::AtLeastOnce,
            op_timeout: Duration::from_secs(10),
            drain_window: Duration::from_millis(200),
        }
    }

    /// Forget the client after a failure so `rumqttc` does not reconnect on its own.
    fn reset(&mut self) {
        self.client = None;
        self.eventloop = None;
    }

    fn fail(&mut self, error: MqttConnectionError) -> TransportError {
        self.reset();
        map_connection_error(error)
    }

    /// Poll the event loop until `done` accepts an event.
    async fn poll_until<F>(&mut self, mut done: F) -> Result<(), TransportError>
    where
        F: FnMut(&Event) -> bool + Send,
    {
        let op_timeout = self.op_timeout;
        let eventloop = self.eventloop.as_mut().ok_or(TransportError::NotConnected)?;

        let result = timeout(op_timeout, async {
            loop {
                let event = match eventloop.poll().await {
                    Ok(event) => event,
                    Err(e) => return Err(e),
                };
                trace!("MQTT event: {:?}", event);
                if done(&event) {
                    return Ok(());
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => {
                self.reset();
                Err(TransportError::Timeout(op_timeout))
            }
        }
    }
}

fn map_connection_error(error: MqttConnectionError) -> TransportError {
    match error {
        MqttConnectionError::ConnectionRefused(code) => TransportError::Rejected(format!("{:?}", code)),
        other => TransportError::Connection(other.to_string()),
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn open(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.reset();
        self.target = Some((host.to_string(), port));
        Ok(())
    }

    async fn handshake(&mut self, handshake: &Handshake) -> Result<(), TransportError> {
        let (host, port) = self.target.clone().ok_or(TransportError::NotConnected)?;

        let mut options = MqttOptions::new(&handshake.client_id, host, port);
        options.set_keep_alive(handshake.keep_alive);
        options.set_clean_session(handshake.clean_session);
        if let Some(username) = &handshake.username {
            options.set_credentials(username, handshake.password.clone().unwrap_or_default());
        }
        if let Some(will) = &handshake.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                handshake.qos,
                will.retain,
            ));
        }

        self.qos = handshake.qos;
        self.op_timeout = handshake.timeout;

        let (client, eventloop) = AsyncClient::new(options, 10);
        self.client = Some(client);
        self.eventloop = Some(eventloop);

        self.poll_until(|event| matches!(event, Event::Incoming(Incoming::ConnAck(_))))
            .await?;
        debug!("MQTT handshake with {} completed", handshake.client_id);
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        if let Err(e) = client.publish(topic, self.qos, retain, payload.to_vec()).await {
            self.reset();
            return Err(TransportError::Client(e.to_string()));
        }

        match self.qos {
            QoS::AtMostOnce => {
                self.poll_until(|event| matches!(event, Event::Outgoing(Outgoing::Publish(_))))
                    .await
            }
            _ => {
                self.poll_until(|event| matches!(event, Event::Incoming(Incoming::PubAck(_))))
                    .await
            }
        }
    }

    async fn keepalive(&mut self) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.drain_window;
        let eventloop = self.eventloop.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            match timeout_at(deadline, eventloop.poll()).await {
                // Quiet connection, nothing more to service for now
                Err(_) => return Ok(()),
                Ok(Ok(Event::Incoming(Incoming::PingResp))) => trace!("MQTT ping acknowledged"),
                Ok(Ok(Event::Outgoing(Outgoing::PingReq))) => trace!("MQTT ping sent"),
                Ok(Ok(Event::Incoming(Incoming::Disconnect))) => {
                    self.reset();
                    return Err(TransportError::Connection("broker closed the session".to_string()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(self.fail(e)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            self.reset();
            return Ok(());
        };

        if let Err(e) = client.disconnect().await {
            self.reset();
            return Err(TransportError::Client(e.to_string()));
        }
        let result = self
            .poll_until(|event| matches!(event, Event::Outgoing(Outgoing::Disconnect)))
            .await;
        self.reset();
        result
    }
}

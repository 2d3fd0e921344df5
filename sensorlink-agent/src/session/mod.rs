//! MQTT session management
//!
//! Owns the single broker connection of the process:
//! - connect / handshake with a clean session and a last-will on the availability topic
//! - publish, serialized through one async mutex (one network write at a time)
//! - keepalive ticks
//! - reconnect with exponential backoff after any transport failure
//! - graceful disconnect
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                     |                          |
//!                     v                          v
//!               Disconnected                   Failed
//! ```

mod backoff;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use transport::{Handshake, MqttTransport, RumqttTransport, Will};

use crate::error::{ConnectionError, PublishError, TransportError};
use crate::model::Broker;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Transitions kept for diagnostics
const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Connection counters, readable without locking the session
#[derive(Clone, Default)]
pub struct SessionStats {
    connections: Arc<AtomicU32>,
    reconnects: Arc<AtomicU32>,
    published: Arc<AtomicU64>,
    last_error: Arc<SyncMutex<Option<String>>>,
    history: Arc<SyncMutex<VecDeque<SessionState>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u32,
    pub reconnects: u32,
    pub published: u64,
    pub last_error: Option<String>,
    /// Most recent state transitions, oldest first
    pub history: Vec<SessionState>,
}

impl SessionStats {
    fn record_connected(&self) {
        if self.connections.fetch_add(1, Ordering::Relaxed) > 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, error: &dyn fmt::Display) {
        *self.last_error.lock() = Some(error.to_string());
    }

    fn record_state(&self, state: SessionState) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(state);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            history: self.history.lock().iter().copied().collect(),
        }
    }
}

/// Connection state machine over one transport
pub struct Session<T> {
    transport: T,
    broker: Broker,
    client_id: String,
    availability_topic: String,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    stats: SessionStats,
}

impl<T: MqttTransport> Session<T> {
    pub fn new(transport: T, broker: Broker, client_id: String, availability_topic: String) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let stats = SessionStats::default();
        stats.record_state(SessionState::Disconnected);
        Self {
            transport,
            broker,
            client_id,
            availability_topic,
            state: SessionState::Disconnected,
            state_tx,
            stats,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("MQTT session {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
            self.stats.record_state(state);
        }
    }

    fn handshake(&self) -> Handshake {
        Handshake {
            client_id: self.client_id.clone(),
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            keep_alive: self.broker.keep_alive,
            clean_session: true,
            last_will: Some(Will {
                topic: self.availability_topic.clone(),
                payload: OFFLINE.to_string(),
                retain: true,
            }),
            qos: self.broker.qos,
            timeout: self.broker.operation_timeout,
        }
    }

    /// Open the transport and handshake. No retry here: the caller owns the policy.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let (attempt_state, fallback) = match self.state {
            SessionState::Reconnecting | SessionState::Failed => {
                (SessionState::Reconnecting, SessionState::Reconnecting)
            }
            _ => (SessionState::Connecting, SessionState::Disconnected),
        };
        self.set_state(attempt_state);

        let host = self.broker.host.clone();
        let port = self.broker.port;

        if let Err(source) = self.transport.open(&host, port).await {
            self.stats.record_error(&source);
            self.set_state(fallback);
            return Err(ConnectionError::Transport { host, port, source });
        }

        let handshake = self.handshake();
        if let Err(source) = self.transport.handshake(&handshake).await {
            self.stats.record_error(&source);
            if let Err(e) = self.transport.close().await {
                debug!("Closing failed transport: {}", e);
            }
            self.set_state(fallback);
            return Err(match source {
                TransportError::Rejected(reason) => ConnectionError::Rejected { host, port, reason },
                source => ConnectionError::Transport { host, port, source },
            });
        }

        self.set_state(SessionState::Connected);
        self.stats.record_connected();

        let topic = self.availability_topic.clone();
        if let Err(source) = self.transport.send(&topic, ONLINE.as_bytes(), true).await {
            self.mark_lost(&source).await;
            return Err(ConnectionError::Lost(source));
        }

        info!("Connected to MQTT broker {}:{} as {}", host, port, self.client_id);
        Ok(())
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        if self.state != SessionState::Connected {
            return Err(PublishError::NotConnected(self.state));
        }

        match self.transport.send(topic, payload, retain).await {
            Ok(()) => {
                self.stats.record_published();
                Ok(())
            }
            Err(source) => {
                self.mark_lost(&source).await;
                Err(PublishError::Transport {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Keepalive tick; must run more often than the negotiated keep-alive.
    pub async fn tick(&mut self) -> Result<(), ConnectionError> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        if let Err(source) = self.transport.keepalive().await {
            self.mark_lost(&source).await;
            return Err(ConnectionError::Lost(source));
        }
        Ok(())
    }

    /// Graceful teardown, safe to call in any state.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Connected {
            let topic = self.availability_topic.clone();
            if let Err(e) = self.transport.send(&topic, OFFLINE.as_bytes(), true).await {
                debug!("Could not announce offline state: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!("MQTT close failed: {}", e);
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn mark_lost(&mut self, source: &TransportError) {
        warn!("MQTT connection lost: {}", source);
        self.stats.record_error(source);
        if let Err(e) = self.transport.close().await {
            debug!("Closing broken transport: {}", e);
        }
        self.set_state(SessionState::Reconnecting);
    }

    fn fail(&mut self) {
        self.set_state(SessionState::Failed);
    }
}

/// Shared handle to the session; every operation goes through its mutex.
pub struct SessionManager<T> {
    inner: Arc<Mutex<Session<T>>>,
    state_rx: watch::Receiver<SessionState>,
    lost: Arc<Notify>,
    stats: SessionStats,
    policy: ReconnectPolicy,
}

impl<T> Clone for SessionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            state_rx: self.state_rx.clone(),
            lost: self.lost.clone(),
            stats: self.stats.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<T: MqttTransport> SessionManager<T> {
    pub fn new(session: Session<T>, policy: ReconnectPolicy) -> Self {
        let state_rx = session.state_tx.subscribe();
        let stats = session.stats.clone();
        Self {
            inner: Arc::new(Mutex::new(session)),
            state_rx,
            lost: Arc::new(Notify::new()),
            stats,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.lock().await.connect().await
    }

    pub async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        let result = self.inner.lock().await.publish(topic, payload, retain).await;
        if let Err(PublishError::Transport { .. }) = &result {
            self.lost.notify_one();
        }
        result
    }

    pub async fn tick(&self) -> Result<(), ConnectionError> {
        let result = self.inner.lock().await.tick().await;
        if result.is_err() {
            self.lost.notify_one();
        }
        result
    }

    /// Resolves after a publish or keepalive detected a broken connection.
    pub async fn connection_lost(&self) {
        self.lost.notified().await
    }

    pub async fn disconnect(&self) {
        self.inner.lock().await.disconnect().await
    }

    /// Connect, retrying with backoff until connected, cancelled or out of attempts.
    ///
    /// The session lock is only held during an attempt, never while sleeping.
    pub async fn establish(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }

            {
                let mut session = self.inner.lock().await;
                if session.state() == SessionState::Connected {
                    return Ok(());
                }
                attempts += 1;
                match session.connect().await {
                    Ok(()) => {
                        if attempts > 1 {
                            info!("MQTT session restored after {} attempts", attempts);
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("MQTT connection attempt {} failed: {}", attempts, e);
                        if self.policy.exhausted(attempts) {
                            session.fail();
                            return Err(ConnectionError::Exhausted { attempts });
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!("Retrying MQTT connection in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Scripted transport: pops one outcome per operation, defaulting to success
    #[derive(Default)]
    struct ScriptedTransport {
        opens: Arc<AtomicU32>,
        fail_opens: u32,
        reject: bool,
        fail_sends: u32,
        fail_keepalives: u32,
        keepalives: Arc<AtomicU32>,
        sent: Arc<SyncMutex<Vec<(String, String, bool)>>>,
    }

    #[async_trait]
    impl MqttTransport for ScriptedTransport {
        async fn open(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            if self.fail_opens > 0 {
                self.fail_opens -= 1;
                return Err(TransportError::Connection("refused".to_string()));
            }
            Ok(())
        }

        async fn handshake(&mut self, _handshake: &Handshake) -> Result<(), TransportError> {
            if self.reject {
                return Err(TransportError::Rejected("NotAuthorized".to_string()));
            }
            Ok(())
        }

        async fn send(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(TransportError::Connection("broken pipe".to_string()));
            }
            self.sent.lock().push((
                topic.to_string(),
                String::from_utf8_lossy(payload).to_string(),
                retain,
            ));
            Ok(())
        }

        async fn keepalive(&mut self) -> Result<(), TransportError> {
            self.keepalives.fetch_add(1, Ordering::Relaxed);
            if self.fail_keepalives > 0 {
                self.fail_keepalives -= 1;
                return Err(TransportError::Timeout(Duration::from_secs(1)));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn session(transport: ScriptedTransport) -> Session<ScriptedTransport> {
        Session::new(
            transport,
            Broker::new("localhost", 1883),
            "sensorlink-test".to_string(),
            "attic/availability".to_string(),
        )
    }

    fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_connect_announces_online() {
        let transport = ScriptedTransport::default();
        let sent = transport.sent.clone();
        let mut session = session(transport);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            sent.lock().clone(),
            vec![("attic/availability".to_string(), "online".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut session = session(ScriptedTransport {
            reject: true,
            ..Default::default()
        });

        let result = session.connect().await;
        assert!(matches!(result, Err(ConnectionError::Rejected { .. })));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mut session = session(ScriptedTransport::default());
        let result = session.publish("attic/temp/state", b"21.5", false).await;
        assert!(matches!(
            result,
            Err(PublishError::NotConnected(SessionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_moves_to_reconnecting() {
        let mut session = session(ScriptedTransport::default());
        session.connect().await.unwrap();
        session.transport.fail_sends = 1;

        let result = session.publish("attic/temp/state", b"21.5", false).await;
        assert!(matches!(result, Err(PublishError::Transport { .. })));
        assert_eq!(session.state(), SessionState::Reconnecting);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let stats = session.stats.snapshot();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(
            stats.history,
            vec![
                SessionState::Disconnected,
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Reconnecting,
                SessionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_keepalive_failure_moves_to_reconnecting() {
        let transport = ScriptedTransport {
            fail_keepalives: 1,
            ..Default::default()
        };
        let keepalives = transport.keepalives.clone();
        let manager = SessionManager::new(session(transport), fast_policy(None));

        // Nothing to service while disconnected
        manager.tick().await.unwrap();
        assert_eq!(keepalives.load(Ordering::Relaxed), 0);

        manager.connect().await.unwrap();
        let result = manager.tick().await;
        assert!(matches!(result, Err(ConnectionError::Lost(TransportError::Timeout(_)))));
        assert_eq!(manager.state(), SessionState::Reconnecting);

        // The supervisor is woken up
        tokio::time::timeout(Duration::from_secs(1), manager.connection_lost())
            .await
            .unwrap();

        manager.establish(&CancellationToken::new()).await.unwrap();
        manager.tick().await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(keepalives.load(Ordering::Relaxed), 2);

        let stats = manager.stats();
        assert_eq!(stats.reconnects, 1);
        assert!(stats.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_establish_retries_until_connected() {
        let transport = ScriptedTransport {
            fail_opens: 3,
            ..Default::default()
        };
        let opens = transport.opens.clone();
        let manager = SessionManager::new(session(transport), fast_policy(None));

        manager.establish(&CancellationToken::new()).await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(opens.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_establish_gives_up() {
        let transport = ScriptedTransport {
            fail_opens: 10,
            ..Default::default()
        };
        let manager = SessionManager::new(session(transport), fast_policy(Some(2)));

        let result = manager.establish(&CancellationToken::new()).await;
        assert!(matches!(result, Err(ConnectionError::Exhausted { attempts: 2 })));
        assert_eq!(manager.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_establish_cancelled() {
        let transport = ScriptedTransport {
            fail_opens: u32::MAX,
            ..Default::default()
        };
        let manager = SessionManager::new(session(transport), fast_policy(None));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let result = manager.establish(&cancel).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_disconnect_announces_offline() {
        let transport = ScriptedTransport::default();
        let sent = transport.sent.clone();
        let manager = SessionManager::new(session(transport), fast_policy(None));

        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), SessionState::Disconnected);

        let last = sent.lock().last().cloned().unwrap();
        assert_eq!(last, ("attic/availability".to_string(), "offline".to_string(), true));

        // Idempotent
        manager.disconnect().await;
        assert_eq!(sent.lock().len(), 2);
    }
}

//! Top-level driver
//!
//! `start()` validates the model, then spawns a driver task that:
//! 1. establishes the MQTT session (retrying with backoff)
//! 2. publishes one retained discovery message per sensor and parent device
//! 3. runs one poll loop per sensor and parent, plus the keepalive/reconnect supervisor
//! 4. on cancellation, grants in-flight polls a grace period and disconnects

use crate::discovery::{self, DiscoveryMessage};
use crate::error::{ConfigError, ConnectionError, PublishError, RunError};
use crate::execution::CommandExecutor;
use crate::model::{EntityModel, Sensor};
use crate::session::{MqttTransport, Session, SessionManager, SessionState};
use crate::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Running pipeline. Dropping it cancels the run; the driver still disconnects.
pub struct RunHandle<T> {
    cancel: CancellationToken,
    driver: Option<JoinHandle<Result<(), RunError>>>,
    session: SessionManager<T>,
}

impl<T: MqttTransport> RunHandle<T> {
    pub fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    /// Token that stops the run when cancelled (e.g. from a signal handler)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown and wait for polls to drain and the session to close.
    pub async fn stop(mut self) -> Result<(), RunError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the run to end on its own or through the cancellation token.
    pub async fn wait(mut self) -> Result<(), RunError> {
        self.join().await
    }

    async fn join(&mut self) -> Result<(), RunError> {
        match self.driver.take() {
            Some(driver) => driver.await?,
            None => Ok(()),
        }
    }
}

impl<T> Drop for RunHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Validate the model and start publishing.
///
/// Must be called from within a Tokio runtime. Configuration errors are
/// returned before the transport is touched.
pub fn start<T: MqttTransport>(
    model: EntityModel,
    settings: Settings,
    transport: T,
) -> Result<RunHandle<T>, ConfigError> {
    model.validate()?;
    settings.validate()?;

    let client_id = model.broker.client_id.clone().unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("sensorlink-{}-{}", discovery::topic_id(&model.device.name), &suffix[..8])
    });
    let availability = discovery::availability_topic(&settings, &model.device);
    let session = Session::new(transport, model.broker.clone(), client_id, availability);
    let session = SessionManager::new(session, settings.reconnect.clone());

    let cancel = CancellationToken::new();
    let driver = tokio::spawn(drive(
        Arc::new(model),
        Arc::new(settings),
        session.clone(),
        cancel.clone(),
    ));

    Ok(RunHandle {
        cancel,
        driver: Some(driver),
        session,
    })
}

async fn drive<T: MqttTransport>(
    model: Arc<EntityModel>,
    settings: Arc<Settings>,
    session: SessionManager<T>,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let outcome = run(&model, &settings, &session, &cancel).await;

    session.disconnect().await;
    let stats = session.stats();
    info!(
        "MQTT session closed ({} messages published, {} reconnects)",
        stats.published, stats.reconnects
    );

    if let Err(e) = &outcome {
        error!("Scheduler stopped: {}", e);
    }
    outcome
}

async fn run<T: MqttTransport>(
    model: &Arc<EntityModel>,
    settings: &Arc<Settings>,
    session: &SessionManager<T>,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    info!(
        "Starting scheduler for device '{}' with {} sensors",
        model.device.name,
        model.sensors.len()
    );

    match session.establish(cancel).await {
        Ok(()) => {}
        Err(ConnectionError::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let mut announced = 0;
    for sensor in &model.sensors {
        for device in model.parents_of(sensor) {
            let message = discovery::compose(settings, device, sensor);
            match publish_discovery(session, &message, cancel).await {
                Ok(()) => announced += 1,
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
    info!("Published {} discovery messages", announced);

    let polls_cancel = cancel.child_token();
    let executor = CommandExecutor::new(settings.shell.clone());
    let mut polls = JoinSet::new();

    for sensor in &model.sensors {
        for device in model.parents_of(sensor) {
            let job = PollJob {
                state_topic: discovery::state_topic(settings, device, sensor),
                period: settings.poll_interval(sensor),
                timeout: settings.command_timeout_for(sensor),
                retain: settings.retain_state,
                sensor: sensor.clone(),
            };
            polls.spawn(poll_sensor(
                job,
                executor.clone(),
                session.clone(),
                polls_cancel.clone(),
            ));
        }
    }

    let outcome = supervise(session, keepalive_period(model), cancel).await;

    // Stop scheduling, then give in-flight polls one grace period
    polls_cancel.cancel();
    drain(&mut polls, settings.shutdown_grace).await;

    outcome
}

/// Publish one discovery message, reconnecting as often as needed.
async fn publish_discovery<T: MqttTransport>(
    session: &SessionManager<T>,
    message: &DiscoveryMessage,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        match session.publish(&message.topic, message.payload.as_bytes(), true).await {
            Ok(()) => {
                debug!("Discovery published on {}", message.topic);
                return Ok(());
            }
            Err(e) => {
                warn!("Discovery for {} not sent: {}", message.topic, e);
                session.establish(cancel).await?;
            }
        }
    }
}

fn keepalive_period(model: &EntityModel) -> Duration {
    model.broker.keep_alive / 2
}

/// Keepalive ticks and reconnection until cancelled or out of attempts.
async fn supervise<T: MqttTransport>(
    session: &SessionManager<T>,
    period: Duration,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(e) = session.tick().await {
                    warn!("Keepalive failed: {}", e);
                }
            }
            _ = session.connection_lost() => {}
        }

        if session.state() != SessionState::Connected {
            match session.establish(cancel).await {
                Ok(()) => info!("State publication resumed"),
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct PollJob {
    sensor: Sensor,
    state_topic: String,
    period: Duration,
    timeout: Duration,
    retain: bool,
}

/// One sensor's poll loop; readings are published in the order they are produced.
async fn poll_sensor<T: MqttTransport>(
    job: PollJob,
    executor: CommandExecutor,
    session: SessionManager<T>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(job.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = match executor.evaluate(&job.sensor, job.timeout).await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Skipping cycle: {}", e);
                continue;
            }
        };

        match session
            .publish(&job.state_topic, reading.raw_text.as_bytes(), job.retain)
            .await
        {
            Ok(()) => debug!("{} <- {} ({})", job.state_topic, reading.raw_text, reading.timestamp),
            Err(PublishError::NotConnected(state)) => {
                debug!("Reading of {} dropped, session {}", job.sensor.name, state)
            }
            Err(e) => warn!("Reading of {} dropped: {}", job.sensor.name, e),
        }
    }
    debug!("Poll loop of {} on {} stopped", job.sensor.name, job.state_topic);
}

async fn drain(polls: &mut JoinSet<()>, grace: Duration) {
    let finished = tokio::time::timeout(grace, async {
        while let Some(result) = polls.join_next().await {
            if let Err(e) = result {
                error!("Poll task failed: {}", e);
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!("{} polls still running after {:?}, aborting", polls.len(), grace);
        polls.abort_all();
        while polls.join_next().await.is_some() {}
    }
}

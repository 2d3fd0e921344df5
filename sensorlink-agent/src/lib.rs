//! SensorLink Agent - shell-command sensors for Home Assistant
//!
//! Each configured sensor is a shell command whose trimmed stdout is
//! published to an MQTT broker:
//! - Home Assistant discovery config, once per sensor and parent device
//! - periodic state updates on per-sensor intervals
//! - availability with a last-will, reconnecting with exponential backoff

pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod settings;

pub use config::AppConfig;
pub use error::{
    ConfigError, ConnectionError, LoadError, PublishError, RunError, TransportError, ValuationCause,
    ValuationError,
};
pub use execution::CommandExecutor;
pub use model::{Broker, Device, EntityModel, Sensor, SensorReading};
pub use scheduler::{start, RunHandle};
pub use session::{
    MqttTransport, ReconnectPolicy, RumqttTransport, Session, SessionManager, SessionState,
    StatsSnapshot,
};
pub use settings::Settings;

/// Name reported in the discovery `origin` block
pub const SOFTWARE_NAME: &str = "SensorLink";
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

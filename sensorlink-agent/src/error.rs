//! Error taxonomy for the sensor pipeline
//!
//! - `ConfigError`: invalid entity model or settings, fatal before scheduling
//! - `ValuationError`: a sensor command failed, the cycle is skipped
//! - `ConnectionError`: broker unreachable, rejected or lost, recovered by reconnecting
//! - `PublishError`: a write failed, may trigger the reconnect path
//! - `TransportError`: raw failure reported by the MQTT client collaborator

use crate::session::SessionState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, reported before any session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device name must not be empty")]
    EmptyDeviceName,

    #[error("broker host {0:?} is empty or contains whitespace")]
    InvalidBrokerHost(String),

    #[error("broker port must be between 1 and 65535")]
    InvalidBrokerPort,

    #[error("broker client id {0:?} is empty or starts with whitespace")]
    InvalidClientId(String),

    #[error("broker password given without a username")]
    PasswordWithoutUsername,

    #[error("broker keep-alive must be at least {min}s, got {got}s")]
    KeepAliveTooShort { min: u64, got: u64 },

    #[error("broker keep-alive must be at most {max}s, got {got}s")]
    KeepAliveTooLong { max: u64, got: u64 },

    #[error("unsupported MQTT QoS level {0} (expected 0 or 1)")]
    UnsupportedQos(u8),

    #[error("sensor #{index} has an empty name")]
    EmptySensorName { index: usize },

    #[error("sensor '{sensor}' has an empty command")]
    EmptyCommand { sensor: String },

    #[error("sensor '{sensor}' has no parent device")]
    NoParentDevice { sensor: String },

    #[error("sensor '{sensor}' references unknown device '{device}'")]
    UnknownDevice { sensor: String, device: String },

    #[error("sensor '{sensor}' lists device '{device}' more than once")]
    DuplicateParent { sensor: String, device: String },

    #[error("device '{device}' has two sensors named '{name}'")]
    DuplicateSensor { device: String, name: String },

    #[error("device '{device}': sensors '{first}' and '{second}' share topic id '{topic_id}'")]
    TopicIdCollision {
        device: String,
        first: String,
        second: String,
        topic_id: String,
    },

    #[error("{field} of '{owner}' must be greater than zero")]
    ZeroDuration { owner: String, field: &'static str },

    #[error("reconnect max delay {max:?} is below the initial delay {initial:?}")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },

    #[error("reconnect jitter must be within [0, 1], got {0}")]
    InvalidJitter(String),

    #[error("reconnect max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("setting '{0}' must not be empty")]
    EmptySetting(&'static str),
}

/// Why a sensor command did not produce a reading.
#[derive(Debug, Error)]
pub enum ValuationCause {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to collect command output: {0}")]
    Output(#[source] std::io::Error),

    #[error("command output exceeds {0} bytes")]
    OutputTooLarge(usize),

    #[error("command produced no output")]
    EmptyOutput,
}

#[derive(Debug, Error)]
#[error("sensor '{sensor}' valuation failed: {cause}")]
pub struct ValuationError {
    pub sensor: String,
    #[source]
    pub cause: ValuationCause,
}

/// Failure reported by an MQTT client collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("broker refused the connection: {0}")]
    Rejected(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("client request failed: {0}")]
    Client(String),

    #[error("connection failure: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("cannot reach broker {host}:{port}: {source}")]
    Transport {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("broker {host}:{port} rejected the session: {reason}")]
    Rejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("connection lost: {0}")]
    Lost(#[source] TransportError),

    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("connection attempt cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("session is {0}, message not sent")]
    NotConnected(SessionState),

    #[error("failed to publish to '{topic}': {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Configuration file could not be read.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not determine a configuration directory")]
    NoConfigDir,

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Abnormal end of a running scheduler.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("scheduler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

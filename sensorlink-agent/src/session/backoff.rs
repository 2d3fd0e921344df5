//! Reconnect delay policy: exponential, capped, with random jitter

use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff configuration for broker reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on any delay. Default: 60s.
    pub max_delay: Duration,

    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,

    /// Connection attempts before the session is declared failed.
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `attempt`-th consecutive failure (0-based), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2_f64.powi(attempt.min(32) as i32);
        let base = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::ZeroDuration {
                owner: "reconnect".to_string(),
                field: "initial delay",
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::MaxDelayBelowInitial {
                initial: self.initial_delay,
                max: self.max_delay,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidJitter(self.jitter.to_string()));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

/// Delay sequence for one outage; dropped once the session is back.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.policy.nominal_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        apply_jitter(nominal, self.policy.jitter, &mut rand::thread_rng())
    }
}

/// Draw uniformly from `[base * (1 - jitter), base]`, so the cap is never exceeded.
fn apply_jitter(base: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    // NaN would make the sampling range empty
    let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
    if jitter == 0.0 || base.is_zero() {
        return base;
    }
    base.mul_f64(rng.gen_range((1.0 - jitter)..=1.0))
}

//! Exponential reconnect backoff

use std::time::Duration;

use ha_config::ReconnectConfig;

/// Delay sequence for consecutive reconnect attempts
///
/// Starts at the initial delay, multiplies after every attempt, and never
/// exceeds the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff.min(config.max_backoff),
            max: config.max_backoff,
            multiplier: config.multiplier.max(1),
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

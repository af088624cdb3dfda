use std::cmp::min;
use std::time::Duration;
use crate::config::ReconnectPolicy;

/// Delays between a client's reconnect attempts, growing exponentially up to a maximum
pub struct ReconnectBackoff {
    attempts: u32,
    next_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
    config_max_attempts: Option<u32>,
}

impl ReconnectBackoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let result = ReconnectBackoff {
            attempts: 0,
            next_delay: policy.initial_delay,
            config_initial_delay: policy.initial_delay,
            config_max_delay: policy.max_delay,
            config_factor_eighths: policy.factor_eighths,
            config_max_attempts: policy.max_attempts,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay before the next reconnect attempt, or `None` if the configured number of
    ///  attempts is exhausted
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.config_max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }

        self.attempts += 1;
        let result = self.next_delay;

        self.next_delay = self.next_delay.checked_mul(self.config_factor_eighths)
            .map_or(self.config_max_delay, |d| min(d / 8, self.config_max_delay));
        Some(result)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.config_initial_delay;
    }
}

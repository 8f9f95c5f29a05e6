use rand::Rng;
use std::time::Duration;
use crate::config::ReconnectConfig;

/// Exponential reconnect delay with full jitter. Never gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay())
    }

    /// Delay before the next attempt, somewhere in `[0, ceiling]`.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current;
        self.attempts += 1;
        self.current = (self.current * 2).min(self.max);

        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Upper bound of the next delay.
    #[cfg(test)]
    pub fn ceiling(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

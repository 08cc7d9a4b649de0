//! Exponential backoff between dial attempts.

use std::time::Duration;

/// Configuration for redialing after transient failures
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Growth factor applied after every failed attempt
    pub multiplier:    f64,
    /// Ceiling for any single delay
    pub max_delay:     Duration,
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts:  u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier:    1.6,
            max_delay:     Duration::from_secs(10),
            max_attempts:  0, // infinite
        }
    }
}

impl BackoffConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Delays between consecutive attempts.
///
/// Yields one delay per failed attempt and ends once `max_attempts` attempts
/// were made. Delays never decrease and never exceed `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    config:   BackoffConfig,
    attempts: u32,
    next:     Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial_delay.min(config.max_delay);
        Self {
            config,
            attempts: 0,
            next,
        }
    }

    /// Attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next = self.config.initial_delay.min(self.config.max_delay);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    /// Records a failed attempt and returns how long to wait before the
    /// next one, or `None` when no attempts are left.
    fn next(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        let delay = self.next;
        let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * self.config.multiplier)
            .unwrap_or(self.config.max_delay);
        self.next = grown.min(self.config.max_delay).max(delay);
        Some(delay)
    }
}

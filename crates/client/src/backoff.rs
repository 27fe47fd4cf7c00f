use std::time::Duration;

use {rand::Rng, tether_config::ReconnectConfig};

/// Bounded exponential backoff with proportional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay(),
            max: config.max_delay(),
            max_attempts: config.max_attempts,
            jitter: if config.jitter.is_finite() {
                config.jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
            attempt: 0,
        }
    }

    /// Attempts handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let base = self.base_delay(self.attempt);
        self.attempt += 1;
        if self.jitter == 0.0 {
            return Some(base);
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Some(base.mul_f64(factor).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

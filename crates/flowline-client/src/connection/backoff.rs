use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Linear reconnection backoff with symmetric jitter, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    randomization: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, randomization: f64) -> Self {
        Self {
            base,
            max,
            randomization: randomization.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnection_delay,
            config.reconnection_delay_max,
            config.randomization_factor,
        )
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::thread_rng().gen::<f64>())
    }

    /// Same as [`Backoff::delay`] with the random draw supplied; `unit` is
    /// in `0.0..=1.0` and maps onto `-randomization..=randomization`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let linear = self.base.saturating_mul(attempt.max(1)).min(self.max);
        let jitter = (unit.clamp(0.0, 1.0) * 2.0 - 1.0) * self.randomization;
        if jitter == 0.0 {
            return linear;
        }
        let scaled = (linear.as_secs_f64() * (1.0 + jitter)).clamp(0.0, self.max.as_secs_f64());
        // A cap near `Duration::MAX` rounds up past what a Duration can hold.
        Duration::try_from_secs_f64(scaled).map_or(self.max, |delay| delay.min(self.max))
    }
}

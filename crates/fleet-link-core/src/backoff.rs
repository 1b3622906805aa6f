//! Bounded exponential backoff with proportional jitter.

use std::time::Duration;

use rand::Rng;

use crate::BackoffConfig;

/// Exponential backoff for reconnect delays.
///
/// The `n`-th call to [`Backoff::duration`] (counting from zero since the
/// last reset) yields `min(max, min * multiplier^n)` plus up to
/// `jitter * that` of uniform noise, clamped to `[min, max]`.
///
/// Not synchronized. The session controller is the only driver; callers
/// sharing it across tasks wrap it in a mutex.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff from explicit bounds.
    #[must_use]
    pub fn new(min: Duration, max: Duration, jitter: f64, multiplier: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Create a backoff from configuration.
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.min, config.max, config.jitter, config.multiplier)
    }

    /// Next reconnect delay. Increments the attempt count.
    pub fn duration(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let base = (self.min.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max.as_secs_f64());
        self.attempts = self.attempts.saturating_add(1);

        let spread = base * self.jitter;
        let jittered = if spread > 0.0 {
            base + rand::rng().random_range(0.0..spread)
        } else {
            base
        };

        Duration::try_from_secs_f64(jittered)
            .unwrap_or(self.max)
            .clamp(self.min, self.max)
    }

    /// Forget prior failures.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of delays computed since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

/// Add uniform jitter in `[0, jitter)` to a duration.
#[must_use]
pub fn add_jitter(duration: Duration, jitter: Duration) -> Duration {
    let bound = u64::try_from(jitter.as_nanos()).unwrap_or(u64::MAX);
    if bound == 0 {
        return duration;
    }
    duration.saturating_add(Duration::from_nanos(rand::rng().random_range(0..bound)))
}

// ABOUTME: Exponential backoff with jitter, shared by the delivery retrier and reconnection.
// ABOUTME: Delay doubles per attempt from a base, capped at a maximum, plus a random jitter share.

use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a share of the computed delay (0.0 disables jitter).
    pub jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_ratio: 0.0,
        }
    }

    /// Jitter ratio, clamped to [0, 1]. Non-finite values disable jitter.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = unit(ratio);
        self
    }

    /// Delay before the given attempt (1-based) with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// Delay before the given attempt with a caller-supplied jitter unit in [0, 1].
    pub fn delay_with(&self, attempt: u32, jitter_unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(16);
        let scaled = self.base.saturating_mul(1_u32 << exponent).min(self.max);

        let jitter = scaled.mul_f64(unit(self.jitter_ratio) * unit(jitter_unit));
        scaled.saturating_add(jitter).min(self.max)
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

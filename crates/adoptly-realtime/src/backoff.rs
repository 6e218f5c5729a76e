use std::time::Duration;

/// Exponential reconnect delay with symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random (0.5 = ±50 %).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial.saturating_mul(factor).min(self.max);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::random_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread)
    }
}

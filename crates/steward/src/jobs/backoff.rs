use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter:
/// `min(base * 2^(attempt-1), cap) + jitter`, jitter uniform in [0, 1s).
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(5 * 60),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Pure form: `unit` is the randomness seam, a value in [0, 1).
    /// Given a fixed attempt and a fixed unit the result is deterministic.
    pub fn delay_with(&self, attempt: i32, unit: f64) -> Duration {
        let attempt = attempt.max(1) as u32;
        let exp = attempt.saturating_sub(1);

        // 2^exp with overflow protection; the cap absorbs saturation.
        let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
        let exponential = self
            .base
            .as_millis()
            .saturating_mul(pow2 as u128)
            .min(self.cap.as_millis());

        let jitter_ms = (self.jitter.as_millis() as f64 * unit.clamp(0.0, 1.0)) as u128;
        Duration::from_millis((exponential + jitter_ms) as u64)
    }

    pub fn delay(&self, attempt: i32) -> Duration {
        self.delay_with(attempt, rand::thread_rng().gen::<f64>())
    }
}

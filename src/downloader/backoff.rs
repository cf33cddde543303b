// Exponential backoff with jitter between strategy attempts

use std::time::Duration;

use rand::Rng;

use super::config::BackoffSection;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    aggressive_base: Duration,
    factor: f64,
    max: Duration,
    jitter_ms: u64,
    aggressive_jitter_ms: u64,
    aggressive_hosts: Vec<String>,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffSection) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            aggressive_base: Duration::from_millis(config.aggressive_base_delay_ms),
            factor: config.factor.max(1.0),
            max: Duration::from_millis(config.max_delay_ms),
            jitter_ms: config.jitter_ms,
            aggressive_jitter_ms: config.aggressive_jitter_ms.max(config.jitter_ms),
            aggressive_hosts: config
                .aggressive_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Never sleeps
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            aggressive_base: Duration::ZERO,
            factor: 1.0,
            max: Duration::ZERO,
            jitter_ms: 0,
            aggressive_jitter_ms: 0,
            aggressive_hosts: Vec::new(),
        }
    }

    pub fn is_aggressive(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.aggressive_hosts.iter().any(|h| *h == host)
    }

    /// Delay after the `failures`-th consecutive failure (1-based)
    pub fn delay_for<R: Rng + ?Sized>(&self, failures: u32, host: &str, rng: &mut R) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let (base, jitter_ms) = if self.is_aggressive(host) {
            (self.aggressive_base, self.aggressive_jitter_ms)
        } else {
            (self.base, self.jitter_ms)
        };
        let exponent = (failures - 1).min(16) as i32;
        let scaled_ms = base.as_millis() as f64 * self.factor.powi(exponent);
        let capped_ms = scaled_ms.min(self.max.as_millis() as f64).max(0.0) as u64;

        let jitter = if jitter_ms > 0 {
            rng.gen_range(0..=jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped_ms + jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(&BackoffSection::default())
    }
}

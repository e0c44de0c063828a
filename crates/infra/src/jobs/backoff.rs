//! Table-driven retry delays with uniform jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReliabilityConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    table: Vec<Duration>,
    jitter: f64,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_config(&ReliabilityConfig::default())
    }
}

impl BackoffSchedule {
    /// An empty table means "retry immediately".
    pub fn new(table: Vec<Duration>, jitter: f64) -> Self {
        Self {
            table,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ReliabilityConfig) -> Self {
        Self::new(config.backoff_table.clone(), config.backoff_jitter)
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Un-jittered delay before the attempt that follows failed attempt
    /// `attempt` (1-indexed). Past the end of the table the last entry repeats.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.table.len().saturating_sub(1));
        self.table.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn calculate(&self, attempt: u32) -> Duration {
        self.calculate_with(attempt, &mut rand::thread_rng())
    }

    pub fn calculate_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        // Saturates instead of panicking when the product overflows.
        Duration::try_from_secs_f64(base.as_secs_f64() * factor.max(0.0)).unwrap_or(Duration::MAX)
    }
}

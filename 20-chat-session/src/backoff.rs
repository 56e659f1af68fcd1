use std::time::Duration;

use rand::Rng;

/// Exponential reconnect delay with a cap and jitter.
///
/// The nominal delay doubles per attempt from `initial` up to `max`; the
/// delay actually used is drawn uniformly from the upper half of it so that
/// many clients dropped together do not redial in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt without jitter.
    pub fn nominal(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling = nominal.as_millis() as u64;
        if ceiling == 0 {
            return nominal;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

use std::time::Duration;

/// Exponential queue-level retry: `base`, `2 * base`, ... until
/// `max_attempts` executions have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_attempts: 3,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the next execution after `attempts_made` failed ones,
    /// or `None` once the budget in `max_attempts` is spent.
    pub fn delay_after(&self, attempts_made: u32, max_attempts: u32) -> Option<Duration> {
        if attempts_made == 0 || attempts_made >= max_attempts {
            return None;
        }
        let multiplier = 2u64.saturating_pow(attempts_made - 1);
        let millis = (self.base.as_millis() as u64).saturating_mul(multiplier);
        Some(Duration::from_millis(millis.min(self.max_delay.as_millis() as u64)))
    }
}

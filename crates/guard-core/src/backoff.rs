use serde::{Deserialize, Serialize};

/// Exponential retry delay for transport failures.
///
/// Defaults: 5s, 10s, 20s, 40s ... capped at 10 minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub factor: u32,
    pub cap_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_secs: 5, factor: 2, cap_secs: 10 * 60 }
    }
}

impl BackoffPolicy {
    /// Delay before the next try, given how many attempts have failed so far.
    pub fn delay_secs(&self, failed_attempts: u32) -> u64 {
        let exp = failed_attempts.saturating_sub(1);
        let mut delay = self.base_secs;
        for _ in 0..exp {
            delay = delay.saturating_mul(self.factor as u64);
            if delay >= self.cap_secs {
                return self.cap_secs;
            }
        }
        delay.min(self.cap_secs)
    }
}

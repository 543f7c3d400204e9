//! Capped exponential backoff for failed pushes.

use std::time::Duration;
use sync_types::{SynchroError, Timestamp};

/// Retry schedule for records whose push failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of the exponential delay.
    pub cap: Duration,
    /// Attempts after which a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Add up to half the delay of random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    ///
    /// Formula: min(cap, base * 2^(attempt-1)) + random(0..delay/2)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);

        if self.jitter {
            let half = delay.as_millis() as u64 / 2;
            delay + Duration::from_millis(random_below(half + 1))
        } else {
            delay
        }
    }

    /// When a record that failed with `error` for the `attempt`-th time
    /// may be retried. `None` means the failure is terminal.
    pub fn next_retry(
        &self,
        error: SynchroError,
        attempt: u32,
        now: Timestamp,
    ) -> Option<Timestamp> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        Some(now.saturating_add(self.delay(attempt)))
    }
}

/// Uniform random value in `0..bound`, zero when no entropy is available.
fn random_below(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % bound,
        Err(_) => 0,
    }
}

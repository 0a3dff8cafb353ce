//! # Rate Limiting
//!
//! Per-key exponential backoff used by [`WorkQueue::add_rate_limited`](super::WorkQueue::add_rate_limited).
//!
//! Each call to [`RateLimiter::next_retry`] for the same key doubles the
//! delay (`base * 2^failures`) until `max`; [`RateLimiter::forget`] drops the
//! key's failure count so the next retry starts at `base` again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` should be retried. Records a failure for the key.
    fn next_retry(&self, key: &str) -> Duration;

    /// Clear the failure history of `key`. Unknown keys are ignored.
    fn forget(&self, key: &str);
}

#[derive(Debug)]
pub struct ExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExponentialRateLimiter {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Number of recorded failures for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.get(key).copied().unwrap_or(0)
    }

    fn backoff(&self, exponent: u32) -> Duration {
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl RateLimiter for ExponentialRateLimiter {
    fn next_retry(&self, key: &str) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = failures.entry(key.to_string()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };
        self.backoff(exponent)
    }

    fn forget(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.remove(key);
    }
}

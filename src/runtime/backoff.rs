//! # Restart Backoff
//!
//! Crash-loop backoff for the supervisor: exponential from `min` to `max`
//! with random jitter of `jitter_percent` either side.
//!
//! ## Usage
//!
//! ```rust
//! use controller_runtime::runtime::backoff::RestartBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = RestartBackoff::new(Duration::from_millis(500), Duration::from_secs(60), 0);
//! assert_eq!(backoff.next_delay(), Duration::from_millis(500));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(500));
//! ```

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RestartBackoff {
    min: Duration,
    max: Duration,
    jitter_percent: u64,
    attempts: u32,
}

impl RestartBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration, jitter_percent: u64) -> Self {
        Self {
            min,
            max,
            jitter_percent: jitter_percent.min(100),
            attempts: 0,
        }
    }

    /// Next delay; advances the sequence.
    ///
    /// Jitter is applied before clamping, so the result stays within
    /// `min..=max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = 2u32
            .checked_pow(self.attempts)
            .and_then(|factor| self.min.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max));
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter_percent == 0 {
            return delay;
        }
        #[allow(
            clippy::cast_precision_loss,
            reason = "jitter_percent is clamped to 100"
        )]
        let spread = self.jitter_percent as f64 / 100.0;
        let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        delay.mul_f64(factor).max(self.min).min(self.max)
    }

    /// Back to `min`, after a healthy run or a deliberate stop.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

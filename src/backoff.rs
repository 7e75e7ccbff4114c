//! Capped exponential backoff for the lease wait loop.
//!
//! When another instance holds a key's lease, callers re-read the record
//! after a delay instead of polling the store in a tight loop. The delay
//! doubles per attempt up to [`WaitBackoff::max_delay`]; the overall wait is
//! bounded separately by the proxy's wait budget.

use std::time::Duration;

/// Delay schedule for re-checking a lease held by another instance.
///
/// ```rust
/// # use fleetcache::WaitBackoff;
/// # use std::time::Duration;
/// let backoff = WaitBackoff::new()
///     .initial_delay(Duration::from_millis(50))
///     .max_delay(Duration::from_millis(400));
/// assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(50));
/// assert_eq!(backoff.delay_for_attempt(10), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBackoff {
    /// Delay before the first re-check. Default: 100ms.
    pub initial_delay: Duration,
    /// Upper bound on any single delay. Default: 1s.
    pub max_delay: Duration,
}

impl Default for WaitBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl WaitBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A constant delay between re-checks.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay for a given attempt number (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

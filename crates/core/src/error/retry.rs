//! Retry timing for reconnecting components

use std::time::Duration;

/// Fixed-delay retry schedule; reconnecting components never give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry with the same delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay before the given attempt; the first attempt is immediate
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 { Duration::ZERO } else { self.delay }
    }
}

//! Exponential backoff policy for reconnection delays.
//!
//! `delay(attempt) = min(base * 2^attempt, max)`
//!
//! The policy is pure: it knows nothing about how many attempts are allowed.
//! The attempt ceiling is enforced by the reconnection scheduler.

use std::time::Duration;

/// Retry delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before reconnection attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        // 2^64 overflows u64; anything past that is already capped.
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exponential_ms = base_ms.saturating_mul(factor);

        Duration::from_millis(exponential_ms.min(max_ms))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_millis(1_000, 30_000)
    }
}

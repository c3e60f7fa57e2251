//! Retry policy with exponential backoff for provider calls.
//!
//! | Retried | Not retried |
//! |---------|-------------|
//! | HTTP 429 (rate limited) | HTTP 401/403 (token) |
//! | HTTP 408 and 5xx | HTTP 404 (unknown ticker) |
//! | Connection reset, timeout | Undecodable body |
//!
//! Retrying is off by default: every provider call is billed, so a
//! retry spends quota the admission check never saw.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first. `1` disables retry.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    /// One attempt, no retry.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Retry up to `max_attempts` total attempts with the default curve.
    #[must_use]
    pub const fn with_attempts(max_attempts: u32) -> Self {
        let mut policy = Self::disabled();
        policy.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        policy
    }

    /// Whether more than one attempt is allowed.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Per-call backoff state.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
}

impl Backoff {
    /// Start a fresh call.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 1,
            max_attempts: policy.max_attempts,
            initial_ms: policy.initial_backoff.as_millis() as u64,
            max_ms: policy.max_backoff.as_millis() as u64,
            multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` when attempts are spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let base = self.base_ms();
        self.attempt += 1;
        Some(Duration::from_millis(self.jitter(base).min(self.max_ms)))
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    fn base_ms(&self) -> u64 {
        let factor = self.multiplier.powi((self.attempt - 1) as i32);
        ((self.initial_ms as f64 * factor) as u64).min(self.max_ms)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    fn jitter(&self, base_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || base_ms == 0 {
            return base_ms;
        }
        let spread = base_ms as f64 * self.jitter_factor;
        let low = (base_ms as f64 - spread).max(0.0);
        let high = base_ms as f64 + spread;
        rand::rng().random_range(low..=high) as u64
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_enabled());
        assert_eq!(Backoff::new(&policy).next_backoff(), None);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::with_attempts(0).max_attempts, 1);
        assert!(RetryPolicy::with_attempts(3).is_enabled());
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new(&no_jitter(5));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.attempt(), 5);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            max_backoff: Duration::from_secs(10),
            ..no_jitter(2)
        };
        for _ in 0..50 {
            let delay = Backoff::new(&policy).next_backoff().unwrap();
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
    }

    #[tokio::test]
    async fn uncancelled_sleep_completes() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(5), &cancel).await);
    }
}

//! Retry policy for failed delivery attempts.
//!
//! Maps the number of attempts made so far and the kind of failure to the
//! next action: retry after a delay, or abandon the delivery.
//!
//! Delays grow exponentially from [`RetryPolicy::base_delay`] and are capped at
//! [`RetryPolicy::max_delay`], with ±[`RetryPolicy::jitter_factor`] random
//! jitter. With the defaults (2s base, 5min cap, ±25%, 5 attempts) a
//! persistently failing delivery is retried after ~2s, ~4s, ~8s and ~16s and
//! abandoned after the fifth attempt.

use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE_DELAY_SECS: u64 = 2;
const DEFAULT_MAX_DELAY_SECS: u64 = 300;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Largest exponent applied to the base delay; keeps the multiplication in range.
const MAX_EXPONENT: u32 = 20;

/// Classification of a failed attempt, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network error, timeout, 5xx or 408.
    Transient,
    /// HTTP 429, optionally with a server-provided `Retry-After`.
    RateLimited { retry_after: Option<Duration> },
    /// Non-retryable rejection (4xx other than 408/429).
    Permanent,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the delay has elapsed.
    RetryAfter(Duration),
    /// Stop trying; the delivery is dead-lettered.
    Abandon { reason: String },
}

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Relative jitter in `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Default policy with a custom attempt limit.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Millisecond delays without jitter, for tests that exercise retries
    /// against a live mock server.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_factor: 0.0,
        }
    }

    /// Decides the next action after a failed attempt.
    ///
    /// `attempt_count` is the number of attempts made, including the one that
    /// just failed. Permanent failures are abandoned regardless of the count.
    ///
    /// ```
    /// use std::time::Duration;
    /// use notirelay_agent::retry::{FailureKind, RetryDecision, RetryPolicy};
    ///
    /// let policy = RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() };
    ///
    /// assert_eq!(
    ///     policy.next(1, FailureKind::Transient),
    ///     RetryDecision::RetryAfter(Duration::from_secs(2))
    /// );
    /// assert!(matches!(policy.next(5, FailureKind::Transient), RetryDecision::Abandon { .. }));
    /// assert!(matches!(policy.next(1, FailureKind::Permanent), RetryDecision::Abandon { .. }));
    /// ```
    #[must_use]
    pub fn next(&self, attempt_count: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent {
            return RetryDecision::Abandon {
                reason: "permanent rejection".to_string(),
            };
        }

        if attempt_count >= self.max_attempts {
            return RetryDecision::Abandon {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        if let FailureKind::RateLimited {
            retry_after: Some(retry_after),
        } = kind
        {
            return RetryDecision::RetryAfter(retry_after.min(self.max_delay));
        }

        RetryDecision::RetryAfter(self.delay_for(attempt_count))
    }

    /// Backoff delay after `attempt_count` failed attempts, jitter included.
    #[must_use]
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(MAX_EXPONENT);
        let multiplier = 2_u32.saturating_pow(exponent);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a duration by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
}

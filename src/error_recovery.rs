//! Bounded retry policies for probes and plans.
//!
//! Retries are *off* by default: a validation run must report what it saw, not
//! paper over flaky hardware. A policy can be enabled per probe or plan type in
//! configuration, and even then only transient failures (an unreachable device)
//! are retried. Deterministic faults such as an unknown label or a read fault
//! are reported on the first attempt.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay between attempts
    #[default]
    Fixed,
    /// Delay doubles after every attempt, capped at `max_delay`
    Exponential,
}

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use daq_validate::error_recovery::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 2,
///     backoff: Backoff::Exponential,
///     delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
/// };
/// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. 0 disables retrying.
    pub max_retries: u32,

    /// How the delay grows between attempts.
    pub backoff: Backoff,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Upper bound for exponential growth.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// No retries, 100ms fixed delay if enabled.
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fixed-delay policy.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed,
            delay,
            ..Self::default()
        }
    }

    /// Exponential policy starting at `delay`.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential,
            delay,
            max_delay,
        }
    }

    /// Total number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let shift = retry.saturating_sub(1).min(16);
                self.delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// Run `op` until it produces a value `should_retry` rejects or the policy is
/// exhausted. The closure receives the 1-based attempt number.
///
/// The last produced value is always returned, so callers see the final
/// outcome as data rather than an error.
pub async fn retry_when<T, F, Fut, P>(policy: &RetryPolicy, mut op: F, should_retry: P) -> T
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let mut attempt = 1;
    loop {
        let value = op(attempt).await;
        if attempt >= policy.max_attempts() || !should_retry(&value) {
            return value;
        }
        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after transient failure");
        sleep(delay).await;
        attempt += 1;
    }
}

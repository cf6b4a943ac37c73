//! Reconnect policy and timeout utilities.
//!
//! The stream client uses a fixed-interval policy bounded by a maximum number
//! of attempts. [`RetryState`] tracks the attempt counter and decides whether
//! a connection loss should schedule another attempt.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Policy controlling automatic reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of automatic retries after a connection loss.
    pub max_attempts: u32,
    /// Fixed delay applied before every retry.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Builds a fixed-interval policy.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5_000), 5)
    }
}

/// Outcome of registering a connection loss against a [`RetryState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry should fire after `delay`; `attempt` is the 1-based retry index.
    Retry { attempt: u32, delay: Duration },
    /// Attempts are used up; no retry is scheduled.
    Exhausted { attempts: u32 },
}

/// Attempt counter governed by a [`RetryPolicy`].
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt_count: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
        }
    }

    /// Number of retries scheduled since the last successful connection.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Records a connection loss and decides whether to retry.
    ///
    /// The counter is incremented only when a retry is scheduled, so it never
    /// exceeds `max_attempts`.
    pub fn register_loss(&mut self) -> RetryDecision {
        if self.attempt_count >= self.policy.max_attempts {
            debug!(
                event = "retry_exhausted",
                attempts = self.attempt_count,
                max_attempts = self.policy.max_attempts
            );
            return RetryDecision::Exhausted {
                attempts: self.attempt_count,
            };
        }

        self.attempt_count += 1;
        debug!(
            event = "retry_scheduled",
            attempt = self.attempt_count,
            max_attempts = self.policy.max_attempts,
            delay_ms = self.policy.interval.as_millis() as u64
        );
        RetryDecision::Retry {
            attempt: self.attempt_count,
            delay: self.policy.interval,
        }
    }

    /// Clears the counter after a successful connection or on explicit request.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

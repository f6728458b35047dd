//! Failure classification and exponential backoff.

use std::time::Duration;

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout, rate limiting, unparsable model output. Retried.
    Transient,
    /// Malformed or unsupported input. Never retried.
    Permanent,
    /// The job store or broker is unavailable. Retried on the next tick.
    Infrastructure,
}

/// A failed attempt with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, claimable again after `delay`.
    Retry { retry_count: i32, delay: Duration },
    /// Terminal `Failed`.
    Fail { retry_count: i32 },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^retry_count`, capped at `max_delay`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 30) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the next state for a job that has failed `retry_count` times
    /// before this attempt.
    pub fn decide(&self, retry_count: i32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Permanent {
            return RetryDecision::Fail { retry_count };
        }

        let next = retry_count + 1;
        if next >= self.max_retries {
            RetryDecision::Fail { retry_count: next }
        } else {
            RetryDecision::Retry {
                retry_count: next,
                delay: self.backoff(next),
            }
        }
    }
}

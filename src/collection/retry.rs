//! # Job Retry Policy
//!
//! Classifies per-attempt failures and computes exponential backoff for jobs that
//! are re-enqueued.

use std::time::Duration;

use crate::domain::JobErrorKind;
use crate::infrastructure::config::SchedulerConfig;

/// How a failure kind is treated by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retried until attempts run out
    Transient,
    /// Retried once; the collaborator re-establishes its session on the next attempt
    Authorization,
    /// Terminal without retry
    Permanent,
}

#[must_use]
pub const fn classify(kind: JobErrorKind) -> ErrorClassification {
    match kind {
        JobErrorKind::Timeout | JobErrorKind::NavigationFailed | JobErrorKind::Unknown => {
            ErrorClassification::Transient
        }
        JobErrorKind::AuthRejected => ErrorClassification::Authorization,
        JobErrorKind::NoData => ErrorClassification::Permanent,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Permanent,
    AttemptsExhausted,
    AuthorizationRetryUsed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    #[must_use]
    pub const fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what happens after attempt number `attempts` failed with `kind`.
    ///
    /// `auth_failures` counts authorization failures of this job, the current one included.
    #[must_use]
    pub fn decide(&self, kind: JobErrorKind, attempts: u32, auth_failures: u32) -> RetryDecision {
        match classify(kind) {
            ErrorClassification::Permanent => RetryDecision::GiveUp(GiveUpReason::Permanent),
            _ if attempts >= self.max_attempts => {
                RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted)
            }
            ErrorClassification::Authorization if auth_failures > 1 => {
                RetryDecision::GiveUp(GiveUpReason::AuthorizationRetryUsed)
            }
            ErrorClassification::Authorization | ErrorClassification::Transient => {
                RetryDecision::RetryAfter(self.backoff(attempts))
            }
        }
    }

    /// `base * 2^(attempt-1)`, capped, with up to 10% jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter_ms = fastrand::u64(0..=(delay.as_millis() as u64 / 10));
        delay + Duration::from_millis(jitter_ms)
    }
}

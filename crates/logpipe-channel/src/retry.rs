// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Retry backoff policy.
//!
//! Pure decision logic: maps a 1-based attempt number and a failure
//! classification to either a backoff delay or a terminal "exhausted"
//! signal. Exponential backoff with jitter, capped per group.

use crate::config::GroupConfig;
use rand::Rng;
use std::time::Duration;

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient: network unreachable, 5xx, throttling, timeout.
    Retryable,
    /// Permanent: rejected payload, revoked credential. Never retried.
    Fatal,
}

/// Outcome of a retry evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then re-attempt the same batch.
    Backoff(Duration),
    /// Give up: resolve the batch as failed.
    Exhausted,
}

/// Exponential backoff with jitter, bounded by a per-group retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        RetryPolicy {
            base,
            cap,
            max_retries,
        }
    }

    #[must_use]
    pub fn from_group(config: &GroupConfig) -> Self {
        RetryPolicy::new(
            config.retry_delay_base,
            config.retry_delay_max,
            config.max_retries,
        )
    }

    /// Decides what to do after the `attempt`-th failure (1-based).
    ///
    /// Fatal failures and attempts beyond the retry budget are terminal.
    /// Otherwise the delay is `base * 2^(attempt-1)`, jittered by ±50% and
    /// capped at the configured maximum.
    #[must_use]
    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Fatal || attempt > self.max_retries {
            return RetryDecision::Exhausted;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .base
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        let delayed = scaled.mul_f64(jitter);
        RetryDecision::Backoff(delayed.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60), 3)
    }

    #[test]
    fn first_retryable_failure_backs_off_within_bounds() {
        for _ in 0..100 {
            match policy().decide(1, FailureKind::Retryable) {
                RetryDecision::Backoff(delay) => {
                    assert!(delay >= Duration::from_millis(50));
                    assert!(delay <= Duration::from_millis(150));
                }
                RetryDecision::Exhausted => panic!("attempt 1 must not exhaust"),
            }
        }
    }

    #[test]
    fn backoff_grows_with_attempts_and_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(15), 10);
        match policy.decide(4, FailureKind::Retryable) {
            // 10s * 2^3 = 80s jittered, always above the 15s cap.
            RetryDecision::Backoff(delay) => assert_eq!(delay, Duration::from_secs(15)),
            RetryDecision::Exhausted => panic!("within budget"),
        }
    }

    #[test]
    fn attempts_beyond_budget_exhaust() {
        assert_eq!(
            policy().decide(4, FailureKind::Retryable),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn fatal_failures_never_retry() {
        assert_eq!(
            policy().decide(1, FailureKind::Fatal),
            RetryDecision::Exhausted
        );
    }
}

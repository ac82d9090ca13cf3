// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Batch scheduling decision logic.
//!
//! Pure functions, no I/O: given a group's pending statistics and its
//! configured thresholds, decide whether a batch should be carved now and,
//! if not, how long until the time threshold would trigger one.

use crate::config::GroupConfig;
use std::time::Duration;

/// Outcome of a scheduling evaluation for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// A batch is eligible now: carve and send.
    CarveNow,
    /// Logs are pending but no threshold is met; re-evaluate after the
    /// given delay, when the time threshold fires.
    WaitFor(Duration),
    /// Nothing is pending.
    Idle,
}

/// Evaluates the count and time thresholds for one group.
///
/// `oldest_age` is the age of the oldest pending log, `None` when the group
/// has no pending logs. A manual flush bypasses this function entirely and
/// carves whatever is pending.
#[must_use]
pub fn decide(
    pending_count: usize,
    oldest_age: Option<Duration>,
    config: &GroupConfig,
) -> BatchDecision {
    if pending_count == 0 {
        return BatchDecision::Idle;
    }
    if pending_count >= config.trigger_count {
        return BatchDecision::CarveNow;
    }
    match oldest_age {
        Some(age) if age >= config.trigger_interval => BatchDecision::CarveNow,
        Some(age) => BatchDecision::WaitFor(config.trigger_interval - age),
        // Pending logs but no age reading: treat as freshly enqueued.
        None => BatchDecision::WaitFor(config.trigger_interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: usize, interval_ms: u64) -> GroupConfig {
        GroupConfig {
            trigger_count: count,
            trigger_interval: Duration::from_millis(interval_ms),
            ..GroupConfig::default()
        }
    }

    #[test]
    fn empty_group_is_idle() {
        assert_eq!(decide(0, None, &config(3, 10_000)), BatchDecision::Idle);
    }

    #[test]
    fn count_threshold_triggers_immediately() {
        let cfg = config(3, 10_000);
        assert_eq!(
            decide(3, Some(Duration::from_millis(1)), &cfg),
            BatchDecision::CarveNow
        );
        assert_eq!(
            decide(10, Some(Duration::from_millis(1)), &cfg),
            BatchDecision::CarveNow
        );
    }

    #[test]
    fn below_count_threshold_waits_for_time_threshold() {
        let cfg = config(3, 10_000);
        let decision = decide(2, Some(Duration::from_secs(4)), &cfg);
        assert_eq!(decision, BatchDecision::WaitFor(Duration::from_secs(6)));
    }

    #[test]
    fn time_threshold_triggers() {
        let cfg = config(100, 10_000);
        assert_eq!(
            decide(1, Some(Duration::from_secs(10)), &cfg),
            BatchDecision::CarveNow
        );
        assert_eq!(
            decide(1, Some(Duration::from_secs(11)), &cfg),
            BatchDecision::CarveNow
        );
    }

    #[test]
    fn missing_age_waits_full_interval() {
        let cfg = config(100, 10_000);
        assert_eq!(
            decide(1, None, &cfg),
            BatchDecision::WaitFor(Duration::from_secs(10))
        );
    }
}

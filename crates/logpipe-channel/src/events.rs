// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle notifications.
//!
//! Two mechanisms, matching what each stage needs:
//!
//! - [`LogObserver`] is a synchronous registration-list hook for the two
//!   stages that can influence a log before persistence: the enqueuing hook
//!   may annotate the record, the filtering hook may veto it.
//! - [`ChannelEvent`] is an after-the-fact broadcast for the stages past
//!   persistence: sending, sent, failed, and capacity drops. For a given
//!   log these fire in order enqueuing → filtering → sending → (sent |
//!   failed); sending/sent/failed fire once per resolved batch and apply to
//!   every log in it.

use crate::record::{BatchId, LogRecord};

/// Synchronous observer invoked inline on the enqueue path.
pub trait LogObserver: Send + Sync {
    /// Invoked before persistence; may annotate the record.
    fn on_enqueuing(&self, _record: &mut LogRecord) {}

    /// Invoked after the enqueuing hook; returning `true` vetoes
    /// persistence and the log is dropped. Not an error.
    fn filter(&self, _record: &LogRecord) -> bool {
        false
    }
}

/// Broadcast lifecycle events carrying the group name and batch identity.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A batch is about to go out on the wire.
    Sending {
        group: String,
        batch_id: BatchId,
        log_count: usize,
    },
    /// The ingestion endpoint confirmed the batch.
    Sent {
        group: String,
        batch_id: BatchId,
        log_count: usize,
    },
    /// The batch resolved as failed: fatal transport failure or exhausted
    /// retries.
    Failed {
        group: String,
        batch_id: BatchId,
        log_count: usize,
        reason: String,
    },
    /// Oldest pending logs were evicted to respect the storage capacity.
    /// Distinct from a transport failure.
    Dropped { group: String, dropped: usize },
}

impl ChannelEvent {
    /// Group this event belongs to.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            ChannelEvent::Sending { group, .. }
            | ChannelEvent::Sent { group, .. }
            | ChannelEvent::Failed { group, .. }
            | ChannelEvent::Dropped { group, .. } => group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_observer_passes_everything() {
        struct Noop;
        impl LogObserver for Noop {}

        let observer = Noop;
        let mut record = LogRecord::new("events", serde_json::json!({}));
        observer.on_enqueuing(&mut record);
        assert!(!observer.filter(&record));
    }

    #[test]
    fn event_group_accessor() {
        let event = ChannelEvent::Dropped {
            group: "events".to_string(),
            dropped: 2,
        };
        assert_eq!(event.group(), "events");
    }
}

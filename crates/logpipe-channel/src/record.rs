// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Core data types: log records, batches, and batch identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Returns the current wall-clock time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Opaque identifier assigned to a batch when it is carved from a group's
/// pending queue. A batch id resolves to exactly one terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        BatchId(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One telemetry record submitted by the application.
///
/// Immutable once persisted; observers may annotate the payload during the
/// enqueuing hook, before the record reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Name of the logical group this record belongs to.
    pub group: String,
    /// Store-assigned sequence number, unique and monotonic within a group.
    /// Zero until the record is persisted.
    pub seq: u64,
    /// Generation timestamp, unix milliseconds.
    pub timestamp: u64,
    /// Application-defined payload.
    pub payload: serde_json::Value,
}

impl LogRecord {
    #[must_use]
    pub fn new(group: impl Into<String>, payload: serde_json::Value) -> Self {
        LogRecord {
            group: group.into(),
            seq: 0,
            timestamp: now_millis(),
            payload,
        }
    }
}

/// An immutable, identified collection of logs carved from a group's pending
/// queue for transmission. The unit of sending and of retry: a batch keeps
/// the same id and the same logs across retry attempts.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub group: String,
    pub logs: Vec<LogRecord>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ids_are_unique() {
        let a = BatchId::generate();
        let b = BatchId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn new_record_carries_group_and_timestamp() {
        let record = LogRecord::new("events", serde_json::json!({"k": "v"}));
        assert_eq!(record.group, "events");
        assert_eq!(record.seq, 0);
        assert!(record.timestamp > 0);
    }
}

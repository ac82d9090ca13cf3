// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable, group-partitioned log storage.
//!
//! Each group persists to an append-only JSONL journal under the data
//! directory. Every mutation is one journal line:
//!
//! - `log`: a pending record (seq, timestamp, payload)
//! - `carve`: a contiguous pending prefix became a batch
//! - `resolve`: a batch reached its terminal outcome and its logs are gone
//! - `evict`: oldest pending logs dropped to respect capacity
//!
//! Opening a store replays each journal to rebuild state, tolerating a torn
//! final line from a crash mid-write. Carves with no matching resolve are
//! reverted on replay: their logs return to the pending queue in original
//! FIFO position and a fresh batch id is assigned on the next carve. The
//! journal is compacted on open and again at runtime once dead entries
//! accumulate.
//!
//! A log leaves the store only through capacity eviction or batch
//! resolution, never on process exit.

use crate::error::StoreError;
use crate::record::{now_millis, Batch, BatchId, LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Dead journal entries tolerated before a runtime compaction.
const COMPACT_GARBAGE_THRESHOLD: usize = 1024;

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Log {
        seq: u64,
        timestamp: u64,
        payload: serde_json::Value,
    },
    Carve {
        batch: String,
        through_seq: u64,
    },
    Resolve {
        batch: String,
    },
    Evict {
        through_seq: u64,
    },
}

/// Result of appending one record.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    /// Sequence number assigned to the record.
    pub seq: u64,
    /// Oldest pending logs evicted to make room, zero when under capacity.
    pub evicted: usize,
}

struct GroupPartition {
    path: PathBuf,
    file: File,
    pending: VecDeque<LogRecord>,
    in_flight: HashMap<String, Vec<LogRecord>>,
    next_seq: u64,
    capacity: usize,
    garbage: usize,
}

impl GroupPartition {
    fn write_record(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| StoreError::Corrupt(format!("journal encode: {e}")))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    fn stored_count(&self) -> usize {
        self.pending.len() + self.in_flight.values().map(Vec::len).sum::<usize>()
    }
}

/// Durable, crash-tolerant storage of pending logs and carved batches.
pub struct LogStore {
    groups: HashMap<String, GroupPartition>,
}

impl LogStore {
    /// Opens (or creates) the store for the given groups, replaying and
    /// compacting each group's journal.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        group_names: &[String],
        capacity: usize,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut groups = HashMap::new();
        for name in group_names {
            let path = dir.join(format!("{name}.journal"));
            let partition = Self::open_partition(&path, name, capacity)?;
            groups.insert(name.clone(), partition);
        }
        Ok(LogStore { groups })
    }

    fn open_partition(
        path: &Path,
        group: &str,
        capacity: usize,
    ) -> Result<GroupPartition, StoreError> {
        let mut pending: VecDeque<LogRecord> = VecDeque::new();
        let mut in_flight: HashMap<String, Vec<LogRecord>> = HashMap::new();
        let mut next_seq: u64 = 1;

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        // Torn tail from a crash mid-write: keep what
                        // replayed cleanly and stop here.
                        warn!("group {group}: journal tail unreadable, truncating: {e}");
                        break;
                    }
                };
                match record {
                    JournalRecord::Log {
                        seq,
                        timestamp,
                        payload,
                    } => {
                        pending.push_back(LogRecord {
                            group: group.to_string(),
                            seq,
                            timestamp,
                            payload,
                        });
                        next_seq = next_seq.max(seq + 1);
                    }
                    JournalRecord::Carve { batch, through_seq } => {
                        let mut logs = Vec::new();
                        while pending.front().is_some_and(|r| r.seq <= through_seq) {
                            if let Some(record) = pending.pop_front() {
                                logs.push(record);
                            }
                        }
                        in_flight.insert(batch, logs);
                    }
                    JournalRecord::Resolve { batch } => {
                        in_flight.remove(&batch);
                    }
                    JournalRecord::Evict { through_seq } => {
                        while pending.front().is_some_and(|r| r.seq <= through_seq) {
                            pending.pop_front();
                        }
                    }
                }
            }
        }

        // Unresolved carves from the previous session revert to pending;
        // they will be re-batched under a fresh id.
        if !in_flight.is_empty() {
            debug!(
                "group {group}: reverting {} unresolved batch(es) to pending",
                in_flight.len()
            );
            let mut reverted: Vec<LogRecord> =
                in_flight.drain().flat_map(|(_, logs)| logs).collect();
            reverted.extend(pending.drain(..));
            reverted.sort_by_key(|r| r.seq);
            pending = reverted.into();
        }

        // Compact: rewrite the journal with only the live records.
        let mut partition = GroupPartition {
            path: path.to_path_buf(),
            file: rewrite_journal(path, &pending, &in_flight)?,
            pending,
            in_flight,
            next_seq,
            capacity,
            garbage: 0,
        };
        // Recovery may have left the group over capacity.
        let evicted = partition_evict_overflow(&mut partition)?;
        if evicted > 0 {
            warn!("group {group}: evicted {evicted} logs over capacity during recovery");
        }
        Ok(partition)
    }

    fn partition(&self, group: &str) -> Result<&GroupPartition, StoreError> {
        self.groups
            .get(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))
    }

    fn partition_mut(&mut self, group: &str) -> Result<&mut GroupPartition, StoreError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| StoreError::UnknownGroup(group.to_string()))
    }

    /// Appends a record to its group's pending queue, assigning its
    /// sequence number and evicting the oldest pending logs if the group is
    /// over capacity.
    pub fn append(
        &mut self,
        group: &str,
        mut record: LogRecord,
    ) -> Result<AppendOutcome, StoreError> {
        let partition = self.partition_mut(group)?;

        record.seq = partition.next_seq;
        partition.next_seq += 1;

        partition.write_record(&JournalRecord::Log {
            seq: record.seq,
            timestamp: record.timestamp,
            payload: record.payload.clone(),
        })?;
        let seq = record.seq;
        partition.pending.push_back(record);

        let evicted = partition_evict_overflow(partition)?;
        if evicted > 0 {
            warn!("group {group}: storage capacity exceeded, dropped {evicted} oldest log(s)");
        }
        Ok(AppendOutcome { seq, evicted })
    }

    /// Atomically moves up to `max_count` logs from the front of the
    /// pending queue into a new batch. Returns `None` when nothing is
    /// pending.
    pub fn carve(&mut self, group: &str, max_count: usize) -> Result<Option<Batch>, StoreError> {
        let partition = self.partition_mut(group)?;
        if partition.pending.is_empty() || max_count == 0 {
            return Ok(None);
        }

        let take = max_count.min(partition.pending.len());
        let logs: Vec<LogRecord> = partition.pending.drain(..take).collect();
        let id = BatchId::generate();
        let through_seq = logs.last().map_or(0, |r| r.seq);

        partition.write_record(&JournalRecord::Carve {
            batch: id.as_str().to_string(),
            through_seq,
        })?;
        partition.in_flight.insert(id.as_str().to_string(), logs.clone());

        debug!("group {group}: carved batch {id} with {} log(s)", logs.len());
        Ok(Some(Batch {
            id,
            group: group.to_string(),
            logs,
        }))
    }

    /// Removes a batch after its terminal outcome (sent or fatally failed).
    pub fn resolve(&mut self, group: &str, batch_id: &BatchId) -> Result<(), StoreError> {
        let partition = self.partition_mut(group)?;
        let logs = partition
            .in_flight
            .remove(batch_id.as_str())
            .ok_or_else(|| StoreError::UnknownBatch(batch_id.to_string()))?;
        partition.write_record(&JournalRecord::Resolve {
            batch: batch_id.as_str().to_string(),
        })?;
        // The batch's log lines plus carve and resolve markers are now dead.
        partition.garbage += logs.len() + 2;
        self.maybe_compact(group)
    }

    /// Number of pending (not yet carved) logs in a group.
    pub fn pending_count(&self, group: &str) -> usize {
        self.partition(group).map_or(0, |p| p.pending.len())
    }

    /// Age of the oldest pending log, `None` when nothing is pending.
    pub fn oldest_pending_age(&self, group: &str) -> Option<Duration> {
        let partition = self.partition(group).ok()?;
        let oldest = partition.pending.front()?;
        Some(Duration::from_millis(
            now_millis().saturating_sub(oldest.timestamp),
        ))
    }

    fn maybe_compact(&mut self, group: &str) -> Result<(), StoreError> {
        let partition = self.partition_mut(group)?;
        if partition.garbage < COMPACT_GARBAGE_THRESHOLD {
            return Ok(());
        }
        debug!("group {group}: compacting journal ({} dead entries)", partition.garbage);
        partition.file = rewrite_journal(&partition.path, &partition.pending, &partition.in_flight)?;
        partition.garbage = 0;
        Ok(())
    }
}

/// Rewrites a journal to hold only live state (crash-safe: temp file then
/// rename), returning a fresh append handle.
fn rewrite_journal(
    path: &Path,
    pending: &VecDeque<LogRecord>,
    in_flight: &HashMap<String, Vec<LogRecord>>,
) -> Result<File, StoreError> {
    let tmp_path = path.with_extension("journal.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        // In-flight logs first: they carry the lowest sequence numbers, and
        // replay expects carves to consume a contiguous pending prefix.
        let mut batches: Vec<(&String, &Vec<LogRecord>)> = in_flight.iter().collect();
        batches.sort_by_key(|(_, logs)| logs.first().map_or(0, |r| r.seq));
        for (batch, logs) in batches {
            for record in logs {
                write_line(
                    &mut tmp,
                    &JournalRecord::Log {
                        seq: record.seq,
                        timestamp: record.timestamp,
                        payload: record.payload.clone(),
                    },
                )?;
            }
            write_line(
                &mut tmp,
                &JournalRecord::Carve {
                    batch: batch.clone(),
                    through_seq: logs.last().map_or(0, |r| r.seq),
                },
            )?;
        }
        for record in pending {
            write_line(
                &mut tmp,
                &JournalRecord::Log {
                    seq: record.seq,
                    timestamp: record.timestamp,
                    payload: record.payload.clone(),
                },
            )?;
        }
        tmp.sync_data()?;
    }
    fs::rename(&tmp_path, path)?;

    Ok(OpenOptions::new().append(true).open(path)?)
}

fn write_line(file: &mut File, record: &JournalRecord) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| StoreError::Corrupt(format!("journal encode: {e}")))?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Evicts oldest pending logs until the group is back under capacity.
fn partition_evict_overflow(partition: &mut GroupPartition) -> Result<usize, StoreError> {
    if partition.stored_count() <= partition.capacity {
        return Ok(0);
    }
    let overflow = partition.stored_count() - partition.capacity;
    // Only pending logs are evictable: a carved batch is immutable until it
    // resolves.
    let evictable = overflow.min(partition.pending.len());
    if evictable == 0 {
        return Ok(0);
    }
    let mut through_seq = 0;
    for _ in 0..evictable {
        if let Some(record) = partition.pending.pop_front() {
            through_seq = record.seq;
        }
    }
    partition.write_record(&JournalRecord::Evict { through_seq })?;
    partition.garbage += evictable + 1;
    Ok(evictable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn open(dir: &TempDir, capacity: usize) -> LogStore {
        LogStore::open(dir.path(), &groups(&["events"]), capacity).expect("store should open")
    }

    fn append_n(store: &mut LogStore, group: &str, n: usize) {
        for i in 0..n {
            store
                .append(group, LogRecord::new(group, json!({ "i": i })))
                .expect("append should succeed");
        }
    }

    #[test]
    fn append_assigns_monotonic_seqs() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 100);

        let a = store
            .append("events", LogRecord::new("events", json!({})))
            .unwrap();
        let b = store
            .append("events", LogRecord::new("events", json!({})))
            .unwrap();
        assert!(b.seq > a.seq);
        assert_eq!(store.pending_count("events"), 2);
    }

    #[test]
    fn unknown_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 100);
        let result = store.append("nope", LogRecord::new("nope", json!({})));
        assert!(matches!(result, Err(StoreError::UnknownGroup(_))));
    }

    #[test]
    fn carve_preserves_fifo_order() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 100);
        append_n(&mut store, "events", 5);

        let batch = store.carve("events", 3).unwrap().expect("batch expected");
        assert_eq!(batch.len(), 3);
        let payloads: Vec<i64> = batch
            .logs
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert_eq!(store.pending_count("events"), 2);
    }

    #[test]
    fn carve_empty_group_returns_none() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 100);
        assert!(store.carve("events", 10).unwrap().is_none());
    }

    #[test]
    fn resolve_removes_batch_permanently() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 100);
        append_n(&mut store, "events", 3);

        let batch = store.carve("events", 10).unwrap().unwrap();
        store.resolve("events", &batch.id).unwrap();

        // A second resolution of the same id is an error.
        assert!(matches!(
            store.resolve("events", &batch.id),
            Err(StoreError::UnknownBatch(_))
        ));
        assert_eq!(store.pending_count("events"), 0);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 3);
        append_n(&mut store, "events", 3);

        let outcome = store
            .append("events", LogRecord::new("events", json!({ "i": 99 })))
            .unwrap();
        assert_eq!(outcome.evicted, 1);
        assert_eq!(store.pending_count("events"), 3);

        let batch = store.carve("events", 10).unwrap().unwrap();
        let payloads: Vec<i64> = batch
            .logs
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(payloads, vec![1, 2, 99]);
    }

    #[test]
    fn in_flight_logs_are_not_evicted() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, 3);
        append_n(&mut store, "events", 2);
        let batch = store.carve("events", 2).unwrap().unwrap();

        // Two logs in flight, capacity three: the second new append pushes
        // the group over capacity and the oldest *pending* log goes, never
        // the carved ones.
        store
            .append("events", LogRecord::new("events", json!({ "i": 10 })))
            .unwrap();
        let outcome = store
            .append("events", LogRecord::new("events", json!({ "i": 11 })))
            .unwrap();
        assert_eq!(outcome.evicted, 1);
        assert_eq!(store.pending_count("events"), 1);

        store.resolve("events", &batch.id).unwrap();
        let survivor = store.carve("events", 10).unwrap().unwrap();
        assert_eq!(survivor.logs[0].payload["i"], 11);
    }

    #[test]
    fn reopen_restores_pending_logs() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, 100);
            append_n(&mut store, "events", 4);
        }
        let store = open(&dir, 100);
        assert_eq!(store.pending_count("events"), 4);
        assert!(store.oldest_pending_age("events").is_some());
    }

    #[test]
    fn reopen_reverts_unresolved_carve_in_order() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, 100);
            append_n(&mut store, "events", 5);
            let _batch = store.carve("events", 2).unwrap().unwrap();
            // Crash before the batch resolves.
        }
        let mut store = open(&dir, 100);
        assert_eq!(store.pending_count("events"), 5);

        let batch = store.carve("events", 5).unwrap().unwrap();
        let payloads: Vec<i64> = batch
            .logs
            .iter()
            .map(|r| r.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reopen_drops_resolved_batches() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, 100);
            append_n(&mut store, "events", 3);
            let batch = store.carve("events", 2).unwrap().unwrap();
            store.resolve("events", &batch.id).unwrap();
        }
        let store = open(&dir, 100);
        assert_eq!(store.pending_count("events"), 1);
    }

    #[test]
    fn torn_journal_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open(&dir, 100);
            append_n(&mut store, "events", 3);
        }
        // Simulate a crash mid-append: garbage half-line at the end.
        let path = dir.path().join("events.journal");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"log\",\"seq\":4,\"time").unwrap();
        drop(file);

        let store = open(&dir, 100);
        assert_eq!(store.pending_count("events"), 3);
    }

    #[test]
    fn groups_are_partitioned() {
        let dir = TempDir::new().unwrap();
        let mut store =
            LogStore::open(dir.path(), &groups(&["events", "crashes"]), 100).unwrap();
        append_n(&mut store, "events", 2);
        store
            .append("crashes", LogRecord::new("crashes", json!({})))
            .unwrap();

        assert_eq!(store.pending_count("events"), 2);
        assert_eq!(store.pending_count("crashes"), 1);

        let batch = store.carve("events", 10).unwrap().unwrap();
        store.resolve("events", &batch.id).unwrap();
        assert_eq!(store.pending_count("crashes"), 1);
    }
}

// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for exercising the channel without a network.

use crate::ingestion::{Ingestion, SendFailure};
use crate::record::{Batch, BatchId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// One observed call to [`FakeIngestion::send`].
#[derive(Debug, Clone)]
pub struct SentCall {
    pub group: String,
    pub batch_id: BatchId,
    pub payloads: Vec<serde_json::Value>,
}

/// Scripted [`Ingestion`] double: pops one outcome per send, succeeding once
/// the script runs out, and records every call it sees.
#[derive(Default)]
pub struct FakeIngestion {
    outcomes: Mutex<VecDeque<Result<(), SendFailure>>>,
    calls: Mutex<Vec<SentCall>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeIngestion {
    #[must_use]
    pub fn new() -> Self {
        FakeIngestion::default()
    }

    /// Queues the outcome for the next unscripted send.
    pub fn push_outcome(&self, outcome: Result<(), SendFailure>) {
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .push_back(outcome);
    }

    /// Makes every send stall first, to simulate a slow network.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock poisoned") = Some(delay);
    }

    /// Snapshot of the calls observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    /// Number of send attempts observed so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl Ingestion for FakeIngestion {
    async fn send(&self, group: &str, batch: &Batch) -> Result<(), SendFailure> {
        let delay = *self.delay.lock().expect("lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().expect("lock poisoned").push(SentCall {
            group: group.to_string(),
            batch_id: batch.id.clone(),
            payloads: batch.logs.iter().map(|r| r.payload.clone()).collect(),
        });
        self.outcomes
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

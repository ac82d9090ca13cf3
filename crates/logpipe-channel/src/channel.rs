// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! The log channel: owns the lifecycle of a log from enqueue to durable
//! delivery or permanent discard.
//!
//! The channel runs as a service task driven by a command channel, with a
//! cloneable [`ChannelHandle`] for producers. All group state mutates inside
//! the service loop, so enqueue, gate flips, scheduling, and send results
//! never race. Send attempts run as spawned tasks (one per group at most,
//! single-flight) and report back over an internal results channel; a
//! single logical timer wakes the loop at the earliest per-group deadline
//! for time thresholds and retry backoffs.
//!
//! Per-group state machine:
//!
//! ```text
//! Idle → Accumulating → BatchReady → Sending → {Sent | RetryWaiting | FatalFailed}
//! RetryWaiting → BatchReady (after backoff)
//! ```
//!
//! Disabled and network-blocked are orthogonal gates over the
//! `Accumulating → BatchReady` and `BatchReady → Sending` transitions; they
//! never discard accumulated state.

use crate::config::{ChannelConfig, GroupConfig};
use crate::error::ChannelError;
use crate::events::{ChannelEvent, LogObserver};
use crate::ingestion::{Ingestion, SendFailure};
use crate::record::{Batch, BatchId, LogRecord};
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::scheduler::{self, BatchDecision};
use crate::store::LogStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Capacity of the lifecycle event broadcast; slow subscribers lag.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a bounded-wait shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All in-flight sends resolved before the deadline.
    Completed,
    /// The deadline elapsed; remaining sends were cancelled and their
    /// batches stay durably stored for the next session.
    TimedOut,
}

enum ChannelCommand {
    Enqueue {
        group: String,
        payload: serde_json::Value,
        ack: oneshot::Sender<Result<(), ChannelError>>,
    },
    SetEnabled(bool),
    SetNetworkAllowed(bool),
    CheckPendingLogs,
    Flush,
    Shutdown {
        ack: oneshot::Sender<ShutdownOutcome>,
    },
}

#[derive(Debug)]
enum SendTaskOutcome {
    Success,
    Retryable(String),
    Fatal(String),
    Cancelled,
}

struct SendResult {
    group: String,
    batch_id: BatchId,
    outcome: SendTaskOutcome,
}

enum GroupStatus {
    /// No batch carved; the scheduler decides when one becomes ready.
    Idle,
    /// A send task is in flight for this batch (single-flight slot taken).
    Sending {
        batch: Batch,
        attempt: u32,
        cancel: CancellationToken,
    },
    /// Waiting out a retry backoff (or a reopened network gate).
    RetryWaiting {
        batch: Batch,
        attempt: u32,
        resume_at: Instant,
    },
}

struct GroupState {
    config: GroupConfig,
    status: GroupStatus,
}

/// Builder wiring groups and observers into a channel.
pub struct ChannelBuilder {
    config: ChannelConfig,
    groups: Vec<(String, GroupConfig)>,
    observers: Vec<Box<dyn LogObserver>>,
}

impl ChannelBuilder {
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        ChannelBuilder {
            config,
            groups: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Registers a named group with its batching and retry configuration.
    #[must_use]
    pub fn group(mut self, name: impl Into<String>, config: GroupConfig) -> Self {
        self.groups.push((name.into(), config));
        self
    }

    /// Registers a synchronous observer for the enqueuing and filtering
    /// hooks.
    #[must_use]
    pub fn observer(mut self, observer: Box<dyn LogObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Opens the store (replaying journals) and builds the service plus its
    /// handle. Spawn [`ChannelService::run`] to start the pipeline.
    pub fn build(
        self,
        ingestion: Arc<dyn Ingestion>,
    ) -> Result<(ChannelService, ChannelHandle), ChannelError> {
        let group_names: Vec<String> = self.groups.iter().map(|(n, _)| n.clone()).collect();
        let store = LogStore::open(
            &self.config.data_dir,
            &group_names,
            self.config.max_logs_per_group,
        )?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let groups = self
            .groups
            .into_iter()
            .map(|(name, config)| {
                (
                    name,
                    GroupState {
                        config,
                        status: GroupStatus::Idle,
                    },
                )
            })
            .collect();

        let service = ChannelService {
            config: self.config,
            store,
            groups,
            observers: self.observers,
            ingestion,
            commands_rx,
            results_tx,
            results_rx,
            events: events_tx.clone(),
            enabled: true,
            network_allowed: true,
            shutting_down: false,
        };
        let handle = ChannelHandle {
            commands: commands_tx,
            events: events_tx,
        };
        Ok((service, handle))
    }
}

/// Cloneable producer-side handle to a running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelHandle {
    /// Enqueues one log. Resolves once the log is persisted (or vetoed);
    /// never waits on network I/O. Delivery outcomes are reported through
    /// [`ChannelHandle::subscribe`], not here.
    pub async fn enqueue(
        &self,
        group: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), ChannelError> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(ChannelCommand::Enqueue {
                group: group.into(),
                payload,
                ack,
            })
            .map_err(|_| ChannelError::ShuttingDown)?;
        ack_rx.await.map_err(|_| ChannelError::ShuttingDown)?
    }

    /// Enables or disables the channel. Disabling rejects subsequent
    /// enqueues and schedules no new sends; in-flight sends resolve.
    /// Re-enabling triggers an immediate pending-logs check.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), ChannelError> {
        self.commands
            .send(ChannelCommand::SetEnabled(enabled))
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Opens or closes the network gate. Closing cancels in-flight sends
    /// cooperatively and suspends scheduling; opening re-evaluates every
    /// group.
    pub fn set_network_request_allowed(&self, allowed: bool) -> Result<(), ChannelError> {
        self.commands
            .send(ChannelCommand::SetNetworkAllowed(allowed))
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Idempotent re-evaluation of every group against its thresholds.
    /// Safe to call redundantly (e.g. on every app resume).
    pub fn check_pending_logs(&self) -> Result<(), ChannelError> {
        self.commands
            .send(ChannelCommand::CheckPendingLogs)
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Carves and sends whatever is pending, bypassing thresholds.
    pub fn flush(&self) -> Result<(), ChannelError> {
        self.commands
            .send(ChannelCommand::Flush)
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Stops the scheduler, waits (bounded) for in-flight sends, and leaves
    /// all unresolved logs durably stored for the next session.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(ChannelCommand::Shutdown { ack })
            .is_err()
        {
            // Service already gone; nothing in flight.
            return ShutdownOutcome::Completed;
        }
        ack_rx.await.unwrap_or(ShutdownOutcome::Completed)
    }

    /// Subscribes to lifecycle events (sending, sent, failed, dropped).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

/// The channel service loop. Owns the store and all group state.
pub struct ChannelService {
    config: ChannelConfig,
    store: LogStore,
    groups: HashMap<String, GroupState>,
    observers: Vec<Box<dyn LogObserver>>,
    ingestion: Arc<dyn Ingestion>,
    commands_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    results_tx: mpsc::UnboundedSender<SendResult>,
    results_rx: mpsc::UnboundedReceiver<SendResult>,
    events: broadcast::Sender<ChannelEvent>,
    enabled: bool,
    network_allowed: bool,
    shutting_down: bool,
}

impl ChannelService {
    /// Runs the channel until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("log channel started ({} group(s))", self.groups.len());
        // Logs left over from a previous session may already meet their
        // thresholds.
        self.evaluate_all(false);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        // All handles dropped: drain like a shutdown with
                        // nothing to ack.
                        None => {
                            self.shutting_down = true;
                            break;
                        }
                    }
                }
                Some(result) = self.results_rx.recv() => {
                    self.handle_send_result(result);
                }
                () = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await },
                    if deadline.is_some() =>
                {
                    self.evaluate_all(false);
                }
            }
        }
        debug!("log channel stopped");
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: ChannelCommand) -> bool {
        match command {
            ChannelCommand::Enqueue {
                group,
                payload,
                ack,
            } => {
                let result = self.handle_enqueue(group, payload);
                let _ = ack.send(result);
            }
            ChannelCommand::SetEnabled(enabled) => {
                if self.enabled != enabled {
                    debug!("channel {}", if enabled { "enabled" } else { "disabled" });
                }
                self.enabled = enabled;
                if enabled {
                    self.evaluate_all(false);
                }
            }
            ChannelCommand::SetNetworkAllowed(allowed) => {
                self.network_allowed = allowed;
                if allowed {
                    debug!("network requests allowed, re-evaluating groups");
                    self.evaluate_all(false);
                } else {
                    debug!("network requests suspended, cancelling in-flight sends");
                    for state in self.groups.values() {
                        if let GroupStatus::Sending { cancel, .. } = &state.status {
                            cancel.cancel();
                        }
                    }
                }
            }
            ChannelCommand::CheckPendingLogs => {
                self.evaluate_all(false);
            }
            ChannelCommand::Flush => {
                self.evaluate_all(true);
            }
            ChannelCommand::Shutdown { ack } => {
                let outcome = self.drain_for_shutdown().await;
                let _ = ack.send(outcome);
                return true;
            }
        }
        false
    }

    fn handle_enqueue(
        &mut self,
        group: String,
        payload: serde_json::Value,
    ) -> Result<(), ChannelError> {
        if self.shutting_down {
            return Err(ChannelError::ShuttingDown);
        }
        if !self.groups.contains_key(&group) {
            return Err(ChannelError::UnknownGroup(group));
        }

        let mut record = LogRecord::new(group.clone(), payload);
        for observer in &self.observers {
            observer.on_enqueuing(&mut record);
        }
        if self.observers.iter().any(|o| o.filter(&record)) {
            debug!("group {group}: log vetoed by filter");
            return Ok(());
        }
        if !self.enabled {
            return Err(ChannelError::Disabled);
        }

        let outcome = self.store.append(&group, record)?;
        if outcome.evicted > 0 {
            let _ = self.events.send(ChannelEvent::Dropped {
                group: group.clone(),
                dropped: outcome.evicted,
            });
        }
        self.evaluate_group(&group, false);
        Ok(())
    }

    fn evaluate_all(&mut self, manual_flush: bool) {
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            self.evaluate_group(&name, manual_flush);
        }
    }

    /// Re-evaluates one group's single-flight slot: promotes an elapsed
    /// retry wait, or consults the scheduler and carves a fresh batch.
    /// Idempotent; gated by the enabled flag, the network gate, and
    /// shutdown.
    fn evaluate_group(&mut self, name: &str, manual_flush: bool) {
        if self.shutting_down || !self.enabled || !self.network_allowed {
            return;
        }

        // Decide under a short borrow, then act.
        let promoted: Option<(Batch, u32)> = {
            let Some(state) = self.groups.get_mut(name) else {
                return;
            };
            let retry_ready = match &state.status {
                GroupStatus::Sending { .. } => return,
                GroupStatus::RetryWaiting { resume_at, .. } => {
                    if manual_flush || *resume_at <= Instant::now() {
                        true
                    } else {
                        return;
                    }
                }
                GroupStatus::Idle => false,
            };
            if retry_ready {
                match std::mem::replace(&mut state.status, GroupStatus::Idle) {
                    GroupStatus::RetryWaiting { batch, attempt, .. } => Some((batch, attempt)),
                    other => {
                        state.status = other;
                        None
                    }
                }
            } else {
                None
            }
        };
        if let Some((batch, attempt)) = promoted {
            self.start_send(name, batch, attempt);
            return;
        }

        let (decision, batch_cap) = {
            let Some(state) = self.groups.get(name) else {
                return;
            };
            let pending = self.store.pending_count(name);
            let decision = if manual_flush && pending > 0 {
                BatchDecision::CarveNow
            } else {
                scheduler::decide(pending, self.store.oldest_pending_age(name), &state.config)
            };
            (decision, state.config.trigger_count)
        };

        if decision == BatchDecision::CarveNow {
            match self.store.carve(name, batch_cap) {
                Ok(Some(batch)) => self.start_send(name, batch, 0),
                Ok(None) => {}
                Err(e) => error!("group {name}: failed to carve batch: {e}"),
            }
        }
    }

    /// Spawns the send task for a batch and takes the group's
    /// single-flight slot. `attempt` counts failures already consumed by
    /// this batch.
    fn start_send(&mut self, group: &str, batch: Batch, attempt: u32) {
        let cancel = CancellationToken::new();
        let _ = self.events.send(ChannelEvent::Sending {
            group: group.to_string(),
            batch_id: batch.id.clone(),
            log_count: batch.len(),
        });

        let task_batch = batch.clone();
        let group_name = group.to_string();
        let ingestion = Arc::clone(&self.ingestion);
        let results = self.results_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = token.cancelled() => SendTaskOutcome::Cancelled,
                result = ingestion.send(&group_name, &task_batch) => match result {
                    Ok(()) => SendTaskOutcome::Success,
                    Err(SendFailure::Retryable(reason)) => SendTaskOutcome::Retryable(reason),
                    Err(SendFailure::Fatal(reason)) => SendTaskOutcome::Fatal(reason),
                },
            };
            let _ = results.send(SendResult {
                group: group_name,
                batch_id: task_batch.id,
                outcome,
            });
        });

        if let Some(state) = self.groups.get_mut(group) {
            state.status = GroupStatus::Sending {
                batch,
                attempt,
                cancel,
            };
        }
    }

    fn handle_send_result(&mut self, result: SendResult) {
        let (batch, attempt, policy) = {
            let Some(state) = self.groups.get_mut(&result.group) else {
                return;
            };
            let current = matches!(
                &state.status,
                GroupStatus::Sending { batch, .. } if batch.id == result.batch_id
            );
            if !current {
                // A result from a cancelled or superseded attempt.
                debug!(
                    "group {}: discarding stale send result for batch {}",
                    result.group, result.batch_id
                );
                return;
            }
            let status = std::mem::replace(&mut state.status, GroupStatus::Idle);
            let GroupStatus::Sending { batch, attempt, .. } = status else {
                return;
            };
            (batch, attempt, RetryPolicy::from_group(&state.config))
        };

        let group = result.group;
        match result.outcome {
            SendTaskOutcome::Success => {
                debug!("group {group}: batch {} sent ({} logs)", batch.id, batch.len());
                self.resolve_batch(&group, &batch);
                let _ = self.events.send(ChannelEvent::Sent {
                    group: group.clone(),
                    batch_id: batch.id,
                    log_count: batch.logs.len(),
                });
                self.evaluate_group(&group, false);
            }
            SendTaskOutcome::Fatal(reason) => {
                error!("group {group}: batch {} rejected permanently: {reason}", batch.id);
                self.resolve_batch(&group, &batch);
                let log_count = batch.logs.len();
                let _ = self.events.send(ChannelEvent::Failed {
                    group: group.clone(),
                    batch_id: batch.id,
                    log_count,
                    reason,
                });
                self.evaluate_group(&group, false);
            }
            SendTaskOutcome::Retryable(reason) => {
                let failures = attempt + 1;
                match policy.decide(failures, FailureKind::Retryable) {
                    RetryDecision::Backoff(delay) => {
                        warn!(
                            "group {group}: batch {} failed (attempt {failures}): {reason}; \
                             retrying in {delay:?}",
                            batch.id
                        );
                        if let Some(state) = self.groups.get_mut(&group) {
                            state.status = GroupStatus::RetryWaiting {
                                batch,
                                attempt: failures,
                                resume_at: Instant::now() + delay,
                            };
                        }
                    }
                    RetryDecision::Exhausted => {
                        error!(
                            "group {group}: batch {} failed after {failures} attempt(s): {reason}",
                            batch.id
                        );
                        self.resolve_batch(&group, &batch);
                        let log_count = batch.logs.len();
                        let _ = self.events.send(ChannelEvent::Failed {
                            group: group.clone(),
                            batch_id: batch.id,
                            log_count,
                            reason: format!("retries exhausted: {reason}"),
                        });
                        self.evaluate_group(&group, false);
                    }
                }
            }
            SendTaskOutcome::Cancelled => {
                debug!("group {group}: send of batch {} cancelled", batch.id);
                // The attempt did not consume a retry; resume as soon as
                // the gates reopen.
                if let Some(state) = self.groups.get_mut(&group) {
                    state.status = GroupStatus::RetryWaiting {
                        batch,
                        attempt,
                        resume_at: Instant::now(),
                    };
                }
            }
        }
    }

    fn resolve_batch(&mut self, group: &str, batch: &Batch) {
        if let Err(e) = self.store.resolve(group, &batch.id) {
            error!("group {group}: failed to resolve batch {}: {e}", batch.id);
        }
    }

    /// Earliest wake-up across groups: retry resumes and time thresholds.
    /// No deadline while the gates are closed; reopening re-evaluates
    /// everything anyway.
    fn next_deadline(&self) -> Option<Instant> {
        if self.shutting_down || !self.enabled || !self.network_allowed {
            return None;
        }
        let mut earliest: Option<Instant> = None;
        let mut consider = |candidate: Instant| {
            earliest = Some(earliest.map_or(candidate, |e| e.min(candidate)));
        };
        for (name, state) in &self.groups {
            match &state.status {
                GroupStatus::Sending { .. } => {}
                GroupStatus::RetryWaiting { resume_at, .. } => consider(*resume_at),
                GroupStatus::Idle => {
                    if let BatchDecision::WaitFor(delay) = scheduler::decide(
                        self.store.pending_count(name),
                        self.store.oldest_pending_age(name),
                        &state.config,
                    ) {
                        consider(Instant::now() + delay);
                    }
                }
            }
        }
        earliest
    }

    /// Bounded wait for in-flight sends; anything unresolved stays in the
    /// store for the next session.
    async fn drain_for_shutdown(&mut self) -> ShutdownOutcome {
        self.shutting_down = true;
        let deadline = Instant::now() + self.config.shutdown_timeout;

        while self
            .groups
            .values()
            .any(|g| matches!(g.status, GroupStatus::Sending { .. }))
        {
            match tokio::time::timeout_at(deadline, self.results_rx.recv()).await {
                Ok(Some(result)) => self.handle_send_result(result),
                Ok(None) => break,
                Err(_) => {
                    warn!("shutdown timed out waiting for in-flight sends");
                    for state in self.groups.values() {
                        if let GroupStatus::Sending { cancel, .. } = &state.status {
                            cancel.cancel();
                        }
                    }
                    return ShutdownOutcome::TimedOut;
                }
            }
        }
        ShutdownOutcome::Completed
    }
}

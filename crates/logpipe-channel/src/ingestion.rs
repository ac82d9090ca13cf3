// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Ingestion transport boundary.
//!
//! The channel drives an injected [`Ingestion`] implementation and never
//! talks to the network itself. Implementations classify every outcome as
//! success, retryable failure, or fatal failure; transport timeouts must be
//! reported as retryable.

use crate::record::Batch;
use async_trait::async_trait;

/// A send outcome that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendFailure {
    /// Transient failure eligible for backoff and re-attempt: network
    /// unreachable, 5xx, throttling, timeout.
    #[error("retryable transport failure: {0}")]
    Retryable(String),

    /// Permanent failure that must not be retried: malformed payload,
    /// revoked credential, non-throttling 4xx.
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

/// Transport that delivers one batch to the remote ingestion endpoint.
///
/// May suspend; the channel enforces single-flight per group around it, so
/// implementations never see two concurrent sends for the same group.
#[async_trait]
pub trait Ingestion: Send + Sync {
    async fn send(&self, group: &str, batch: &Batch) -> Result<(), SendFailure>;
}

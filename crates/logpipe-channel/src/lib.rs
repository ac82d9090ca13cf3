// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Client-side durable telemetry log channel.
//!
//! Applications enqueue opaque log records into named groups; the channel
//! persists them to a crash-tolerant store, carves batches on count/time
//! thresholds, and drives an injected ingestion transport with exponential
//! backoff, single-flight-per-group sends, and clean enable/network/shutdown
//! gating. Unresolved logs survive process restarts.
//!
//! ```rust,no_run
//! use logpipe_channel::channel::ChannelBuilder;
//! use logpipe_channel::config::{ChannelConfig, GroupConfig};
//! use logpipe_channel::test_util::FakeIngestion;
//! use std::sync::Arc;
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (service, handle) = ChannelBuilder::new(ChannelConfig::default())
//!     .group("events", GroupConfig::default())
//!     .build(Arc::new(FakeIngestion::new()))?;
//! tokio::spawn(service.run());
//!
//! handle.enqueue("events", serde_json::json!({"name": "app_start"})).await?;
//! handle.shutdown().await;
//! # Ok(()) }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod ingestion;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod test_util;

pub use channel::{ChannelBuilder, ChannelHandle, ChannelService, ShutdownOutcome};
pub use config::{ChannelConfig, GroupConfig};
pub use error::{ChannelError, StoreError};
pub use events::{ChannelEvent, LogObserver};
pub use ingestion::{Ingestion, SendFailure};
pub use record::{Batch, BatchId, LogRecord};

// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport for the logpipe channel.
//!
//! Implements the channel's [`Ingestion`] trait over reqwest, posting each
//! batch as a JSON array to a per-group endpoint and classifying failures
//! as retryable or fatal for the channel's retry policy.
//!
//! [`Ingestion`]: logpipe_channel::ingestion::Ingestion

pub mod http;

pub use http::{HttpIngestion, HttpIngestionConfig};

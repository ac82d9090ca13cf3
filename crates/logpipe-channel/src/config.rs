// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel and per-group configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Channel-wide configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Directory holding the per-group journals.
    pub data_dir: PathBuf,
    /// Maximum stored logs per group. Oldest pending logs are evicted beyond
    /// this, reported as a non-fatal dropped count.
    pub max_logs_per_group: usize,
    /// Bounded wait for in-flight sends during shutdown.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            data_dir: PathBuf::from("logpipe-data"),
            max_logs_per_group: 300,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-group batching and retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Pending-count threshold that triggers a batch. Also the maximum
    /// number of logs carved into one batch.
    pub trigger_count: usize,
    /// Oldest-pending-age threshold that triggers a batch.
    #[serde(with = "duration_millis")]
    pub trigger_interval: Duration,
    /// Maximum number of retries after a retryable failure; the failure
    /// after the last granted retry resolves the batch as failed.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub retry_delay_base: Duration,
    /// Upper bound on any single backoff delay.
    #[serde(with = "duration_millis")]
    pub retry_delay_max: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            trigger_count: 50,
            trigger_interval: Duration::from_secs(3),
            max_retries: 3,
            retry_delay_base: Duration::from_secs(1),
            retry_delay_max: Duration::from_secs(60),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

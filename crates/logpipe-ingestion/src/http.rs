// Copyright 2025-Present logpipe contributors
// SPDX-License-Identifier: Apache-2.0

//! Reqwest-backed ingestion endpoint client.

use async_trait::async_trait;
use logpipe_channel::ingestion::{Ingestion, SendFailure};
use logpipe_channel::record::Batch;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the application key on every ingestion request.
pub const APP_KEY_HEADER: &str = "X-App-Key";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`HttpIngestion`].
#[derive(Debug, Clone)]
pub struct HttpIngestionConfig {
    /// Base URL of the ingestion service, without a trailing path.
    pub endpoint: String,
    /// Application key sent as [`APP_KEY_HEADER`].
    pub app_key: String,
    /// Per-request timeout. Elapsing counts as a retryable failure.
    pub timeout: Duration,
}

impl HttpIngestionConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, app_key: impl Into<String>) -> Self {
        HttpIngestionConfig {
            endpoint: endpoint.into(),
            app_key: app_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Sends batches as JSON arrays to `<endpoint>/v1/logs/<group>`.
///
/// Failure classification drives the channel's retry policy: timeouts,
/// connection errors, 408, 429, and 5xx responses are retryable; any other
/// non-success status means the request itself is unacceptable and retrying
/// the same batch cannot succeed.
pub struct HttpIngestion {
    config: HttpIngestionConfig,
    client: reqwest::Client,
}

impl HttpIngestion {
    pub fn new(config: HttpIngestionConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(HttpIngestion { config, client })
    }

    fn url_for(&self, group: &str) -> String {
        format!(
            "{}/v1/logs/{group}",
            self.config.endpoint.trim_end_matches('/')
        )
    }
}

fn classify_status(status: StatusCode) -> Result<(), SendFailure> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(SendFailure::Retryable(format!("status {status}")));
    }
    Err(SendFailure::Fatal(format!("status {status}")))
}

#[async_trait]
impl Ingestion for HttpIngestion {
    async fn send(&self, group: &str, batch: &Batch) -> Result<(), SendFailure> {
        let payloads: Vec<&serde_json::Value> = batch.logs.iter().map(|r| &r.payload).collect();
        let response = self
            .client
            .post(self.url_for(group))
            .header(APP_KEY_HEADER, &self.config.app_key)
            .json(&payloads)
            .send()
            .await
            .map_err(|e| {
                warn!("group {group}: request failed before a response: {e}");
                SendFailure::Retryable(e.to_string())
            })?;

        let status = response.status();
        match classify_status(status) {
            Ok(()) => {
                debug!(
                    "group {group}: batch {} accepted ({} logs, status {status})",
                    batch.id,
                    batch.len()
                );
                Ok(())
            }
            Err(failure) => {
                warn!("group {group}: batch {} rejected: {failure}", batch.id);
                Err(failure)
            }
        }
    }
}

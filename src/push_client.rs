use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PushClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushMessage {
    pub token: String,
    pub event: PushEvent,
}

/// Outbound push transport. `send` returns one slot per input message:
/// `None` for delivered, `Some(reason)` for a per-message failure. A
/// transport-level failure for the whole batch is the `Err` case.
#[async_trait]
pub trait PushClient: Send + Sync {
    async fn send(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Option<String>>, PushClientError>;
}

/// Posts event batches as JSON to the hosted upstream push endpoint.
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
}

impl UpstreamClient {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl PushClient for UpstreamClient {
    async fn send(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Option<String>>, PushClientError> {
        let response = self
            .http
            .post(&self.url)
            .json(messages)
            .send()
            .await
            .map_err(|err| PushClientError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(PushClientError::Status(response.status().as_u16()));
        }

        Ok(vec![None; messages.len()])
    }
}

/// Sink for deployments without a push provider; devices fall back to SSE.
pub struct NoopClient;

#[async_trait]
impl PushClient for NoopClient {
    async fn send(
        &self,
        messages: &[PushMessage],
    ) -> Result<Vec<Option<String>>, PushClientError> {
        debug!(count = messages.len(), "dropping push batch, no provider configured");
        Ok(vec![None; messages.len()])
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use crate::config::SinkConfig;
use crate::data::types::CanonicalRecord;

/// Destination for normalized records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one record. Returns the HTTP status on success.
    async fn forward(&self, record: &CanonicalRecord) -> Result<u16, ForwardError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Request to sink failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Sink rejected record with status {0}")]
    Rejected(u16),
}

/// Posts records as JSON to the bet ingestion endpoint.
pub struct HttpForwarder {
    client: Client,
    url: String,
}

impl HttpForwarder {
    pub fn new(config: &SinkConfig, url_override: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build sink client")?;

        Ok(Self {
            client,
            url: url_override.unwrap_or_else(|| config.url.clone()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RecordSink for HttpForwarder {
    async fn forward(&self, record: &CanonicalRecord) -> Result<u16, ForwardError> {
        let response = self.client
            .post(&self.url)
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Rejected(status.as_u16()));
        }

        Ok(status.as_u16())
    }
}

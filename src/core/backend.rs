use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::core::config::ClientConfig;
use crate::core::protocol::{ReadCardResponse, ReadReply};

/// Failure to get a usable answer from the reader backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// The two endpoints the client consumes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReaderBackend: Send + Sync {
    /// Liveness probe: `Ok` only for a 2xx answer
    async fn health(&self) -> Result<(), BackendError>;

    /// One card read; a backend refusal is an `Ok(ReadReply::Refused)`
    async fn read_card(&self) -> Result<ReadReply, BackendError>;
}

/// `ReaderBackend` over HTTP
pub struct HttpBackend {
    client: Client,
    health_url: String,
    read_url: String,
    probe_timeout: Duration,
    read_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.probe_timeout())
            .user_agent(concat!("icreader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            health_url: config.endpoint("health"),
            read_url: config.endpoint("card/read"),
            probe_timeout: config.probe_timeout(),
            read_timeout: config.read_timeout(),
        })
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn read_url(&self) -> &str {
        &self.read_url
    }
}

#[async_trait]
impl ReaderBackend for HttpBackend {
    async fn health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(&self.health_url)
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Status(status.as_u16()))
        }
    }

    async fn read_card(&self) -> Result<ReadReply, BackendError> {
        let response = self
            .client
            .get(&self.read_url)
            .timeout(self.read_timeout)
            .send()
            .await?;

        // Refusals come back as 4xx/5xx with a JSON body, so the body decides
        let status = response.status();
        let body = response.text().await?;
        log::debug!("Read response ({}): {}", status.as_u16(), body);

        ReadCardResponse::parse(&body)
    }
}

//! HTTP collaborator used by the feed driver to fetch pages.
//!
//! The driver only depends on the [`Transport`] trait. [`ReqwestTransport`]
//! is the production implementation; tests substitute scripted transports.
use crate::error::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A completed HTTP exchange, whatever its status.
///
/// Headers are always present so rate-limit information can be recorded from
/// error responses as well as successful ones.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues GET requests on behalf of the feed driver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches `url`. Must return promptly with [`TransportError::Cancelled`]
    /// once `cancel` fires, including mid-transfer.
    async fn get(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// Settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("mapfeeds/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            max_response_bytes: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    settings: TransportSettings,
}

impl ReqwestTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { client, settings })
    }

    /// Wraps an existing client (caller controls its configuration).
    pub fn with_client(client: reqwest::Client, settings: TransportSettings) -> Self {
        Self { client, settings }
    }

    async fn fetch(&self, url: &Url) -> Result<TransportResponse, TransportError> {
        let response = tokio::time::timeout(
            self.settings.request_timeout,
            self.client.get(url.clone()).send(),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = read_limited_bytes(response, self.settings.max_response_bytes).await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.fetch(url) => result,
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(TransportError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(TransportError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(TransportError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

//! OpenAI-compatible HTTP transport
//!
//! Posts JSON bodies to the provider and hands back the status plus the raw
//! body as a byte stream. Status interpretation, SSE decoding and fallback
//! live in the dispatcher.

use super::ProviderConfig;
use crate::auth::Credential;
use crate::error::AttemptError;
use crate::stream::ByteStream;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Upstream endpoints used by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRoute {
    ChatCompletions,
    ImageGenerations,
}

impl ApiRoute {
    pub fn path(&self) -> &'static str {
        match self {
            ApiRoute::ChatCompletions => "chat/completions",
            ApiRoute::ImageGenerations => "images/generations",
        }
    }
}

/// Status and body of an upstream response
pub struct RawResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl RawResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// Response with a fully buffered body
    pub fn from_text(status: u16, body: impl Into<String>) -> Self {
        let bytes = body.into().into_bytes();
        Self::from_chunks(status, vec![Ok(bytes)])
    }

    /// Response whose body arrives as the given chunks
    pub fn from_chunks(status: u16, chunks: Vec<Result<Vec<u8>, AttemptError>>) -> Self {
        Self {
            status,
            body: Box::pin(futures::stream::iter(chunks)),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body as text
    pub async fn text(mut self) -> Result<String, AttemptError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Sends one request body upstream
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        route: ApiRoute,
        body: &serde_json::Value,
        credential: &Credential,
    ) -> Result<RawResponse, AttemptError>;
}

/// `reqwest`-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a request-level timeout
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn request(
        &self,
        route: ApiRoute,
        body: &serde_json::Value,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .http_client
            .post(self.config.endpoint(route.path()))
            .header("Authorization", format!("Bearer {}", credential.expose()))
            .header("Content-Type", "application/json");

        if let Some(referer) = &self.config.referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.config.title {
            request = request.header("X-Title", title);
        }

        request.json(body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        route: ApiRoute,
        body: &serde_json::Value,
        credential: &Credential,
    ) -> Result<RawResponse, AttemptError> {
        let response = self.request(route, body, credential).send().await?;
        let status = response.status().as_u16();

        // The connection is released when this stream is dropped
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(AttemptError::from));

        Ok(RawResponse::new(status, Box::pin(body)))
    }
}

//! Upstream forwarder: sends admitted requests to the LLM provider.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;

use switchboard_core::{config::UpstreamConfig, types::UpstreamStatusClass, Error, Result};

/// Request handed to the provider.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub correlation_id: String,
    /// Caller's body, sent as-is so unknown fields survive.
    pub body: Bytes,
    /// Caller's `Authorization` header, used when no provider key is configured.
    pub authorization: Option<String>,
    pub streaming: bool,
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Provider answer. Any HTTP status is an outcome, not an error.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// Buffered JSON response.
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: UpstreamBody::Full(body.into()),
        }
    }

    pub fn class(&self) -> UpstreamStatusClass {
        UpstreamStatusClass::from_status(self.status)
    }
}

/// Seam between the pipeline and the provider transport.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Send the request.
    ///
    /// # Errors
    /// [`Error::UpstreamUnreachable`] when no HTTP response was obtained.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// OpenAI-compatible provider reached over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<Secret<String>>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        tracing::info!(
            endpoint = %endpoint,
            provider_key = config.api_key.is_some(),
            max_retries = config.max_retries,
            "Upstream forwarder initialized"
        );

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorization(&self, request: &UpstreamRequest) -> Option<String> {
        match &self.api_key {
            Some(key) => Some(format!("Bearer {}", key.expose_secret())),
            None => request.authorization.clone(),
        }
    }

    async fn send_once(&self, request: &UpstreamRequest) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());

        if let Some(auth) = self.authorization(request) {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }

        // The per-request timeout covers the body too, which would cut long streams.
        if !request.streaming {
            builder = builder.timeout(self.timeout);
        }

        builder.send().await
    }

    async fn send_with_retries(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let result = if request.streaming {
                match tokio::time::timeout(self.timeout, self.send_once(request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(Error::upstream_unreachable(format!(
                            "no response within {}ms",
                            self.timeout.as_millis()
                        )))
                    }
                }
            } else {
                self.send_once(request).await
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        correlation_id = %request.correlation_id,
                        attempt,
                        error = %e,
                        "Upstream connection failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(transport_error(e)),
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::upstream_unreachable(format!("request timed out: {}", e))
    } else {
        Error::upstream_unreachable(e.to_string())
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let response = self.send_with_retries(&request).await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Only successful streams are relayed incrementally.
        if request.streaming && response.status().is_success() {
            let stream = response.bytes_stream().map_err(transport_error).boxed();
            return Ok(UpstreamResponse {
                status,
                content_type,
                body: UpstreamBody::Stream(stream),
            });
        }

        let body = response.bytes().await.map_err(transport_error)?;
        Ok(UpstreamResponse {
            status,
            content_type,
            body: UpstreamBody::Full(body),
        })
    }
}

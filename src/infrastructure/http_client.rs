//! HTTP client shared by the remote collaborators
//!
//! Wraps a `reqwest` client with a process-wide `governor` rate limiter, so the
//! dashboard, inventory and webhook calls never exceed the configured request
//! rate regardless of how many workers are active.

use anyhow::{Context, Result};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Transport-level failure; HTTP status handling is left to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_requests_per_second: u32,
    /// Keeps dashboard session cookies across requests
    pub cookie_store: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("shelf-sentinel/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_requests_per_second: 20,
            cookie_store: true,
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate-limited HTTP client; clones share the connection pool and the limiter
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    rate_limiter: Arc<DirectLimiter>,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .cookie_store(config.cookie_store)
            .gzip(true)
            .brotli(true)
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );

        Ok(Self {
            client,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Sends a request once the rate limiter admits it.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, HttpError> {
        self.rate_limiter.until_ready().await;
        let request = request.build()?;
        debug!("{} {}", request.method(), request.url());
        Ok(self.client.execute(request).await?)
    }

    /// Like [`send`](Self::send), abandoning the request when `cancel` fires.
    pub async fn send_with_cancellation(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        if cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        tokio::select! {
            result = self.send(request) => result,
            () = cancel.cancelled() => {
                warn!("🛑 HTTP request cancelled");
                Err(HttpError::Cancelled)
            }
        }
    }
}

/// Reads and decodes a JSON body.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, HttpError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode(e.to_string()))
}

/// First part of an error body, for log messages
pub async fn body_excerpt(response: Response) -> String {
    match response.text().await {
        Ok(text) => text.chars().take(100).collect(),
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

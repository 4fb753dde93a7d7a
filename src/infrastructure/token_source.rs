//! Bearer token source backed by a plain-text URL

use async_trait::async_trait;
use tracing::info;

use crate::enrichment::{AuthError, TokenSource};
use crate::infrastructure::http_client::HttpClient;

pub struct HttpTokenSource {
    http: HttpClient,
    url: String,
}

impl HttpTokenSource {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn refresh_token(&self) -> Result<String, AuthError> {
        info!("🔑 Fetching bearer token from {}", self.url);
        let response = self
            .http
            .send(self.http.get(&self.url))
            .await
            .map_err(|e| AuthError::Source(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Source(format!("HTTP {}", status.as_u16())));
        }

        let token = response
            .text()
            .await
            .map_err(|e| AuthError::Source(e.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(token.to_string())
    }
}

//! # Shared Authentication Context
//!
//! Holds the API key and the refreshable bearer token used by every lookup.
//! Writes go through [`AuthContext::refresh`], which admits one refresh at a time;
//! callers holding the same stale token wait on that refresh instead of issuing
//! their own. A failed refresh is remembered per token generation so waiters do
//! not retry it.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::AuthMode;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token source failed: {0}")]
    Source(String),

    #[error("Token source returned an empty token")]
    EmptyToken,

    #[error("No token source configured")]
    NoSource,

    #[error("Token refresh for generation {0} already failed")]
    RefreshFailed(u64),
}

/// Token source collaborator
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh_token(&self) -> Result<String, AuthError>;
}

/// Credentials as seen by one lookup call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub api_key: String,
    pub bearer: Option<String>,
    pub generation: u64,
}

impl AuthSnapshot {
    #[must_use]
    pub fn mode(&self) -> AuthMode {
        match self.bearer {
            Some(_) => AuthMode::Bearer {
                generation: self.generation,
            },
            None => AuthMode::None,
        }
    }
}

#[derive(Debug)]
struct TokenState {
    bearer: Option<String>,
    generation: u64,
    failed_generation: Option<u64>,
}

pub struct AuthContext {
    api_key: String,
    state: RwLock<TokenState>,
    refresh_gate: Mutex<()>,
    source: Option<Arc<dyn TokenSource>>,
    refreshes: AtomicU64,
}

impl AuthContext {
    pub fn new(
        api_key: impl Into<String>,
        bearer: Option<String>,
        source: Option<Arc<dyn TokenSource>>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            state: RwLock::new(TokenState {
                bearer,
                generation: 0,
                failed_generation: None,
            }),
            refresh_gate: Mutex::new(()),
            source,
            refreshes: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        let state = self.state.read().await;
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &TokenState) -> AuthSnapshot {
        AuthSnapshot {
            api_key: self.api_key.clone(),
            bearer: state.bearer.clone(),
            generation: state.generation,
        }
    }

    /// Number of calls made to the token source
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Fetches a first token when none is configured.
    pub async fn prime(&self) -> Result<AuthSnapshot, AuthError> {
        let current = self.snapshot().await;
        if current.bearer.is_some() {
            return Ok(current);
        }
        self.refresh(&current).await
    }

    /// Replaces the token `stale` was built from.
    ///
    /// Returns the newer token immediately if another caller already refreshed it.
    pub async fn refresh(&self, stale: &AuthSnapshot) -> Result<AuthSnapshot, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self.state.read().await;
            if state.generation > stale.generation {
                return Ok(self.snapshot_of(&state));
            }
            if state.failed_generation == Some(stale.generation) {
                return Err(AuthError::RefreshFailed(stale.generation));
            }
        }

        let outcome = match &self.source {
            Some(source) => {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                info!("🔑 Refreshing bearer token (generation {})", stale.generation);
                match source.refresh_token().await {
                    Ok(token) if token.trim().is_empty() => Err(AuthError::EmptyToken),
                    Ok(token) => Ok(token.trim().to_string()),
                    Err(e) => Err(e),
                }
            }
            None => Err(AuthError::NoSource),
        };

        let mut state = self.state.write().await;
        match outcome {
            Ok(token) => {
                state.bearer = Some(token);
                state.generation += 1;
                state.failed_generation = None;
                info!("✅ Bearer token refreshed (generation {})", state.generation);
                Ok(self.snapshot_of(&state))
            }
            Err(e) => {
                warn!("❌ Bearer token refresh failed: {}", e);
                state.failed_generation = Some(state.generation);
                Err(e)
            }
        }
    }
}

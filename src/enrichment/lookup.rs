//! Lookup service seam for product, stock and shelf-location data

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{LocationInfo, ProductInfo, StockInfo};
use crate::enrichment::auth::AuthSnapshot;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Not found")]
    NotFound,

    #[error("Authorization rejected (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Lookup timed out")]
    Timeout,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Lookup cancelled")]
    Cancelled,
}

impl LookupError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

/// The three independent lookup endpoints used per item
#[async_trait]
pub trait InventoryLookup: Send + Sync + 'static {
    async fn product(&self, identifier: &str, auth: AuthSnapshot) -> Result<ProductInfo, LookupError>;

    async fn stock(
        &self,
        location_id: &str,
        identifier: &str,
        auth: AuthSnapshot,
    ) -> Result<StockInfo, LookupError>;

    async fn location(
        &self,
        location_id: &str,
        identifier: &str,
        auth: AuthSnapshot,
    ) -> Result<LocationInfo, LookupError>;
}

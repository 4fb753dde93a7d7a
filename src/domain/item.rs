//! # Flagged Items and Enrichment Results

use serde::{Deserialize, Serialize};

/// A line-item a location reported as not found, queued for enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedItem {
    /// Raw identifier as reported by the dashboard
    pub identifier: String,
    pub name: Option<String>,
    /// Occurrences at the owning location
    pub count: u32,
    pub location_id: String,
}

impl FlaggedItem {
    pub fn new(identifier: impl Into<String>, count: u32, location_id: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            count,
            location_id: location_id.into(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Which identifier resolved the product lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    Primary,
    FallbackIdentifier,
}

/// Credentials attached to the lookup that produced a result.
///
/// `generation` counts token refreshes within the process, so a result built after
/// a coordinated refresh carries a higher generation than the initial token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AuthMode {
    None,
    Bearer { generation: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Identifier the catalog answered for
    pub identifier: String,
    pub description: Option<String>,
    pub primary_barcode: Option<String>,
    pub image_url: Option<String>,
    pub status: Option<String>,
    pub commercially_active: Option<bool>,
    /// Pack components, tried as stock candidates
    pub component_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockInfo {
    /// Identifier that yielded the stock position
    pub identifier: String,
    pub quantity: Option<f64>,
    pub unit_of_measure: Option<String>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    /// Formatted shelf positions, e.g. "Aisle 12, Left bay 3, shelf 2"
    pub standard_locations: Vec<String>,
    pub promotional_locations: Vec<String>,
    pub price: Option<f64>,
}

/// Outcome of one sub-lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "value")]
pub enum SubLookup<T> {
    Found(T),
    NotFound,
    Failed(String),
    /// Never attempted (unresolved identifier or cancellation)
    Skipped,
}

impl<T> SubLookup<T> {
    pub const fn found(&self) -> Option<&T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Merged enrichment for one identifier; partial results are kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub identifier: String,
    /// Identifier the product resolved under, when resolution succeeded
    pub resolved_identifier: Option<String>,
    /// Location whose stock and shelf data were looked up
    pub lookup_location: String,
    pub product: SubLookup<ProductInfo>,
    pub stock: SubLookup<StockInfo>,
    pub location: SubLookup<LocationInfo>,
    pub resolved_via: ResolvedVia,
    pub auth_mode: AuthMode,
}

impl EnrichmentResult {
    /// Complete when at least the product lookup succeeded
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.product.is_found()
    }

    #[must_use]
    pub const fn product_info(&self) -> Option<&ProductInfo> {
        self.product.found()
    }

    #[must_use]
    pub const fn stock_info(&self) -> Option<&StockInfo> {
        self.stock.found()
    }

    #[must_use]
    pub const fn location_info(&self) -> Option<&LocationInfo> {
        self.location.found()
    }
}

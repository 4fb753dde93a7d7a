//! # Report Summaries
//!
//! Immutable outputs of the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::item::{EnrichmentResult, FlaggedItem};
use crate::domain::job::LocationMetrics;

/// One location's count for a network item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationContribution {
    pub location_id: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkItem {
    pub identifier: String,
    pub name: Option<String>,
    pub total_count: u64,
    /// Locations that flagged the item, before `contributors` is truncated
    pub location_count: usize,
    /// Highest counts first, ties by location id ascending
    pub contributors: Vec<LocationContribution>,
    pub enrichment: Option<EnrichmentResult>,
}

/// Cross-location ranking of flagged items, rebuilt once per cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub items: Vec<NetworkItem>,
    /// Distinct identifiers seen before truncation
    pub distinct_items: usize,
    pub total_occurrences: u64,
    pub location_count: usize,
    pub generated_at: DateTime<Utc>,
}

/// Per-location report entry, emitted as soon as the job completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSummary {
    pub location_id: String,
    pub location_name: String,
    pub metrics: LocationMetrics,
    /// Most frequent flagged items at this location
    pub top_items: Vec<FlaggedItem>,
    pub attempts: u32,
}

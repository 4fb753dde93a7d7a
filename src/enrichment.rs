//! # Enrichment Module
//!
//! Resolves flagged items against the product catalog and attaches stock and
//! shelf-location data for the location that flagged them.
//!
//! ## Architecture
//! - `auth`: shared credentials with single-flight token refresh
//! - `identifier`: base-identifier fallback for suffixed identifiers
//! - `lookup`: the lookup service seam
//! - `pipeline`: bounded fan-out with per-identifier dedupe

pub mod auth;
pub mod identifier;
pub mod lookup;
pub mod pipeline;

pub use auth::{AuthContext, AuthError, AuthSnapshot, TokenSource};
pub use identifier::fallback_identifier;
pub use lookup::{InventoryLookup, LookupError};
pub use pipeline::EnrichmentPipeline;

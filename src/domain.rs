//! Domain module - plain data shared by every component
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod item;
pub mod job;
pub mod summary;

pub use item::{
    AuthMode, EnrichmentResult, FlaggedItem, LocationInfo, ProductInfo, ResolvedVia, StockInfo,
    SubLookup,
};
pub use job::{
    CollectedLocation, CollectionError, CycleId, Job, JobErrorKind, JobResult, JobStatus,
    LocationJob, LocationMetrics,
};
pub use summary::{LocationContribution, LocationSummary, NetworkItem, NetworkSummary};

//! Shelf Sentinel - store metrics collection and inventory enrichment
//!
//! Collects per-location metrics from the operator dashboard with an adaptively
//! sized worker pool, enriches the flagged items with product, stock and shelf
//! data, and delivers batched reports to a notification sink.

// Module declarations
pub mod collection;
pub mod cycle;
pub mod domain;
pub mod enrichment;
pub mod infrastructure;
pub mod reporting;

pub use cycle::{CycleError, CycleReport, ReportingCycle};

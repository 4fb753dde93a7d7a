//! # Reporting Module
//!
//! Aggregation of job and enrichment results into the cycle report, and batched
//! delivery of that report to the notification sink.

pub mod aggregator;
pub mod batching;
pub mod sink;

pub use aggregator::{AggregateReport, Aggregator, FailedLocation, ItemTally, LocationReport, rank_network};
pub use batching::{batch_count, chunk_batches};
pub use sink::{BatchedDelivery, DeliveryStats, NotificationSink, ReportBatch, ReportPayload, SinkError};

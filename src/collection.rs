//! # Collection Module
//!
//! Adaptive concurrency control, retry policy and the job scheduler that drives
//! per-location collection jobs.
//!
//! ## Architecture
//! - `concurrency`: resource samples -> pool size target
//! - `retry`: failure classification and backoff
//! - `scheduler`: bounded worker pool with retries and systemic-failure detection
//! - `stats`: run tallies and the job summary

pub mod concurrency;
pub mod retry;
pub mod scheduler;
pub mod stats;

pub use concurrency::{
    ConcurrencyController, ConcurrencyHandle, ConcurrencyState, Decision, ResourceSample,
    ResourceSampler, SampleError, decide,
};
pub use retry::{ErrorClassification, RetryDecision, RetryPolicy, classify};
pub use scheduler::{JobRunner, JobScheduler, SchedulerError, SchedulerRun};
pub use stats::{RunReport, RunStats};

//! # Collection Job Definitions
//!
//! A job collects one location's metrics from the remote dashboard. Jobs are
//! owned by the scheduler until they reach a terminal status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::item::FlaggedItem;

/// Unique identifier for one reporting cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(Uuid);

impl CycleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One location record from the job source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationJob {
    pub location_id: String,
    pub location_name: String,
    /// Key used by the dashboard to address this location
    pub lookup_key: String,
}

impl LocationJob {
    pub fn new(
        location_id: impl Into<String>,
        location_name: impl Into<String>,
        lookup_key: impl Into<String>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            location_name: location_name.into(),
            lookup_key: lookup_key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Error taxonomy surfaced per job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Timeout,
    AuthRejected,
    NavigationFailed,
    NoData,
    Unknown,
}

impl JobErrorKind {
    pub const ALL: [Self; 5] = [
        Self::Timeout,
        Self::AuthRejected,
        Self::NavigationFailed,
        Self::NoData,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::AuthRejected => "auth_rejected",
            Self::NavigationFailed => "navigation_failed",
            Self::NoData => "no_data",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by the browsing-session collaborator for a single attempt
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CollectionError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl CollectionError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Timeout, message)
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::AuthRejected, message)
    }

    pub fn navigation_failed(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::NavigationFailed, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::NoData, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Unknown, message)
    }

    /// The attempt was cut short because the run is stopping
    pub fn interrupted() -> Self {
        Self::new(JobErrorKind::NavigationFailed, INTERRUPTED_MESSAGE)
    }

    /// Whether this failure says nothing about the location itself
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.kind == JobErrorKind::NavigationFailed && self.message == INTERRUPTED_MESSAGE
    }
}

const INTERRUPTED_MESSAGE: &str = "cancelled before completion";

/// Headline dashboard metrics for one location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationMetrics {
    pub orders_shopped: u64,
    pub requested_units: u64,
    pub picked_units: u64,
    pub shorted_units: u64,
    /// Percentage of requested units reported not found
    pub item_not_found_rate: f64,
    pub item_found_rate: f64,
    pub average_units_per_hour: f64,
    pub late_orders: u64,
}

impl LocationMetrics {
    /// Late orders as a percentage of orders shopped
    #[must_use]
    pub fn late_order_rate(&self) -> f64 {
        if self.orders_shopped == 0 {
            return 0.0;
        }
        self.late_orders as f64 / self.orders_shopped as f64 * 100.0
    }
}

/// Payload of a successful job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedLocation {
    pub metrics: LocationMetrics,
    pub flagged_items: Vec<FlaggedItem>,
}

/// A collection unit bound to one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub spec: LocationJob,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<CollectionError>,
    pub result: Option<CollectedLocation>,
}

impl Job {
    #[must_use]
    pub const fn new(spec: LocationJob) -> Self {
        Self {
            spec,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
        }
    }

    #[must_use]
    pub fn location_id(&self) -> &str {
        &self.spec.location_id
    }

    /// `pending|retrying -> running`
    pub fn begin_attempt(&mut self) {
        debug_assert!(matches!(self.status, JobStatus::Pending | JobStatus::Retrying));
        self.attempt_count += 1;
        self.status = JobStatus::Running;
    }

    /// `running -> succeeded`
    pub fn succeed(&mut self, payload: CollectedLocation) {
        self.status = JobStatus::Succeeded;
        self.result = Some(payload);
    }

    /// `running -> retrying`
    pub fn schedule_retry(&mut self, error: CollectionError) {
        self.status = JobStatus::Retrying;
        self.last_error = Some(error);
    }

    /// `running|retrying -> failed`
    pub fn fail(&mut self, error: CollectionError) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error);
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<JobErrorKind> {
        self.last_error.as_ref().map(|e| e.kind)
    }

    /// Failed only because the run stopped underneath it
    #[must_use]
    pub fn was_interrupted(&self) -> bool {
        self.status == JobStatus::Failed
            && self.last_error.as_ref().is_some_and(CollectionError::is_interrupted)
    }
}

/// Terminal job as handed to the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: Job,
    /// Wall time from first start to terminal status, backoff included
    pub elapsed: Duration,
}

impl JobResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.job.status == JobStatus::Succeeded
    }

    #[must_use]
    pub fn location_id(&self) -> &str {
        self.job.location_id()
    }
}

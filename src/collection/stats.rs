//! # Run Statistics
//!
//! Running tallies of one scheduler pass, used for the systemic-failure check
//! and for the job summary in the final report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::{JobErrorKind, JobResult};

#[derive(Debug, Clone, Serialize)]
pub struct TimedLocation {
    pub location_id: String,
    pub elapsed: Duration,
}

/// Job summary for one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs never started because the run was cancelled or aborted first
    pub not_started: usize,
    pub retries: u32,
    pub retried_locations: Vec<String>,
    pub failures_by_kind: BTreeMap<JobErrorKind, Vec<String>>,
    /// Failed jobs whose attempt was cut short by the run stopping; counted in
    /// `failed` but left out of `failures_by_kind`
    pub interrupted: Vec<String>,
    pub average_duration: Option<Duration>,
    pub fastest: Option<TimedLocation>,
    pub slowest: Option<TimedLocation>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    #[must_use]
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Succeeded share of terminal jobs, in percent
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let terminal = self.terminal();
        if terminal == 0 {
            return 0.0;
        }
        self.succeeded as f64 / terminal as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct RunStats {
    submitted: usize,
    succeeded: usize,
    failed: usize,
    retries: u32,
    retried_locations: Vec<String>,
    failures_by_kind: BTreeMap<JobErrorKind, Vec<String>>,
    interrupted: Vec<String>,
    total_elapsed: Duration,
    fastest: Option<TimedLocation>,
    slowest: Option<TimedLocation>,
    started_at: DateTime<Utc>,
}

impl RunStats {
    #[must_use]
    pub fn new(submitted: usize) -> Self {
        Self {
            submitted,
            succeeded: 0,
            failed: 0,
            retries: 0,
            retried_locations: Vec::new(),
            failures_by_kind: BTreeMap::new(),
            interrupted: Vec::new(),
            total_elapsed: Duration::ZERO,
            fastest: None,
            slowest: None,
            started_at: Utc::now(),
        }
    }

    pub fn record_retry(&mut self, location_id: &str) {
        self.retries += 1;
        if !self.retried_locations.iter().any(|id| id == location_id) {
            self.retried_locations.push(location_id.to_string());
        }
    }

    pub fn record_result(&mut self, result: &JobResult) {
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            if result.job.was_interrupted() {
                self.interrupted.push(result.location_id().to_string());
            } else {
                let kind = result.job.error_kind().unwrap_or(JobErrorKind::Unknown);
                self.failures_by_kind
                    .entry(kind)
                    .or_default()
                    .push(result.location_id().to_string());
            }
        }

        self.total_elapsed += result.elapsed;
        let timed = TimedLocation {
            location_id: result.location_id().to_string(),
            elapsed: result.elapsed,
        };
        if self.fastest.as_ref().is_none_or(|f| timed.elapsed < f.elapsed) {
            self.fastest = Some(timed.clone());
        }
        if self.slowest.as_ref().is_none_or(|s| timed.elapsed > s.elapsed) {
            self.slowest = Some(timed);
        }
    }

    #[must_use]
    pub const fn terminal(&self) -> usize {
        self.succeeded + self.failed
    }

    #[must_use]
    pub const fn failed(&self) -> usize {
        self.failed
    }

    /// Failed / terminal
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.terminal() == 0 {
            return 0.0;
        }
        self.failed as f64 / self.terminal() as f64
    }

    #[must_use]
    pub fn finish(self) -> RunReport {
        let terminal = self.terminal();
        let average_duration = (terminal > 0).then(|| {
            self.total_elapsed / u32::try_from(terminal).unwrap_or(u32::MAX)
        });
        RunReport {
            submitted: self.submitted,
            succeeded: self.succeeded,
            failed: self.failed,
            not_started: self.submitted.saturating_sub(terminal),
            retries: self.retries,
            retried_locations: self.retried_locations,
            failures_by_kind: self.failures_by_kind,
            interrupted: self.interrupted,
            average_duration,
            fastest: self.fastest,
            slowest: self.slowest,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

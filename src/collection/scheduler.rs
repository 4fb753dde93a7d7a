//! # Job Scheduler / Worker Pool
//!
//! Runs collection jobs through the browsing-session collaborator with a pool
//! whose size follows the concurrency controller. Failed attempts are classified
//! and either re-enqueued after a backoff or reported as terminal failures.
//!
//! One [`JobScheduler::run`] is one pass: the returned [`SchedulerRun`] yields every
//! terminal [`JobResult`] in completion order and ends when the pool drains.

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, error, info, warn};

use crate::collection::concurrency::ConcurrencyHandle;
use crate::collection::retry::{GiveUpReason, RetryDecision, RetryPolicy};
use crate::collection::stats::{RunReport, RunStats};
use crate::domain::{
    CollectedLocation, CollectionError, Job, JobErrorKind, JobResult, JobStatus, LocationJob,
};
use crate::infrastructure::config::SchedulerConfig;

/// Browsing-session collaborator: collects one location.
///
/// Implementations should return promptly once `cancel` fires.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(
        &self,
        job: &LocationJob,
        cancel: CancellationToken,
    ) -> Result<CollectedLocation, CollectionError>;
}

#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error(
        "Systemic failure: {failed} of {terminal} terminal jobs failed (threshold {:.0}%)",
        .threshold * 100.0
    )]
    SystemicFailure {
        failed: usize,
        terminal: usize,
        threshold: f64,
        report: Box<RunReport>,
    },

    #[error("Scheduler task failed: {0}")]
    Internal(String),
}

pub struct JobScheduler {
    config: SchedulerConfig,
    policy: RetryPolicy,
    runner: Arc<dyn JobRunner>,
    concurrency: ConcurrencyHandle,
    pending: VecDeque<Job>,
    seen: HashSet<String>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn JobRunner>,
        concurrency: ConcurrencyHandle,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            config,
            policy,
            runner,
            concurrency,
            pending: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Queues jobs for the next run. Duplicate location ids are ignored.
    pub fn submit(&mut self, jobs: impl IntoIterator<Item = LocationJob>) -> usize {
        let mut accepted = 0;
        for spec in jobs {
            if !self.seen.insert(spec.location_id.clone()) {
                warn!(location_id = %spec.location_id, "Duplicate job ignored");
                continue;
            }
            self.pending.push_back(Job::new(spec));
            accepted += 1;
        }
        accepted
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Starts the pass. Must be called inside a tokio runtime.
    pub fn run(self, cancel: CancellationToken) -> SchedulerRun {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            stats: RunStats::new(self.pending.len()),
            pending: self.pending.into_iter().map(Tracked::new).collect(),
            delayed: DelayQueue::new(),
            delayed_keys: HashMap::new(),
            in_flight: JoinSet::new(),
            run_token: cancel.child_token(),
            cancel,
            results_tx,
            config: self.config,
            policy: self.policy,
            runner: self.runner,
            concurrency: self.concurrency,
        };
        SchedulerRun {
            results: UnboundedReceiverStream::new(results_rx),
            handle: tokio::spawn(dispatcher.drive()),
        }
    }
}

/// A running pass: a stream of terminal results plus the run-level outcome
pub struct SchedulerRun {
    results: UnboundedReceiverStream<JobResult>,
    handle: JoinHandle<Result<RunReport, SchedulerError>>,
}

impl SchedulerRun {
    /// Waits for the dispatcher. Results not yet consumed are dropped.
    pub async fn join(self) -> Result<RunReport, SchedulerError> {
        self.handle
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))?
    }
}

impl Stream for SchedulerRun {
    type Item = JobResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.results).poll_next(cx)
    }
}

struct Tracked {
    job: Job,
    auth_failures: u32,
    first_started: Option<Instant>,
}

impl Tracked {
    const fn new(job: Job) -> Self {
        Self {
            job,
            auth_failures: 0,
            first_started: None,
        }
    }
}

#[derive(Debug)]
enum StopReason {
    Cancelled,
    Systemic(SchedulerError),
}

type Attempt = (Tracked, Result<CollectedLocation, CollectionError>);

struct Dispatcher {
    config: SchedulerConfig,
    policy: RetryPolicy,
    runner: Arc<dyn JobRunner>,
    concurrency: ConcurrencyHandle,
    stats: RunStats,
    pending: VecDeque<Tracked>,
    delayed: DelayQueue<Tracked>,
    delayed_keys: HashMap<String, delay_queue::Key>,
    in_flight: JoinSet<Attempt>,
    cancel: CancellationToken,
    run_token: CancellationToken,
    results_tx: mpsc::UnboundedSender<JobResult>,
}

impl Dispatcher {
    async fn drive(mut self) -> Result<RunReport, SchedulerError> {
        let mut target_rx = self.concurrency.subscribe();
        let mut target = (*target_rx.borrow_and_update()).max(1);
        let mut target_open = true;
        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stopping: Option<StopReason> = None;

        info!(
            "🚀 Scheduler started: {} jobs, initial pool size {}",
            self.pending.len(),
            target
        );

        loop {
            if stopping.is_none() && !self.cancel.is_cancelled() {
                self.fill_slots(target);
            }
            let queued = !self.pending.is_empty() || !self.delayed.is_empty();
            if self.in_flight.is_empty() && (stopping.is_some() || !queued) {
                break;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled(), if stopping.is_none() => {
                    info!("🛑 Cancellation requested, no further jobs or retries will start");
                    stopping = Some(StopReason::Cancelled);
                    self.abandon_queued();
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok((tracked, outcome)) => self.complete_attempt(tracked, outcome, stopping.is_some()),
                        Err(e) => error!("❌ Worker task lost: {}", e),
                    }
                    if stopping.is_none() {
                        if let Some(systemic) = self.check_systemic() {
                            error!("❌ {}", systemic);
                            self.run_token.cancel();
                            stopping = Some(StopReason::Systemic(systemic));
                            self.abandon_queued();
                        }
                    }
                }
                Some(expired) = self.delayed.next(), if !self.delayed.is_empty() => {
                    let tracked = expired.into_inner();
                    self.delayed_keys.remove(tracked.job.location_id());
                    debug!(location_id = %tracked.job.location_id(), "Retry ready");
                    self.pending.push_back(tracked);
                }
                changed = target_rx.changed(), if target_open => {
                    match changed {
                        Ok(()) => {
                            target = (*target_rx.borrow_and_update()).max(1);
                            debug!("Pool size now {}", target);
                        }
                        Err(_) => target_open = false,
                    }
                }
                _ = poll.tick() => {
                    target = (*target_rx.borrow()).max(1);
                }
            }
        }

        let report = self.stats.finish();
        info!(
            "✅ Scheduler finished: {} succeeded, {} failed, {} not started, {} retries",
            report.succeeded, report.failed, report.not_started, report.retries
        );

        match stopping {
            Some(StopReason::Systemic(SchedulerError::SystemicFailure {
                failed,
                terminal,
                threshold,
                ..
            })) => Err(SchedulerError::SystemicFailure {
                failed,
                terminal,
                threshold,
                report: Box::new(report),
            }),
            Some(StopReason::Systemic(other)) => Err(other),
            Some(StopReason::Cancelled) | None => Ok(report),
        }
    }

    fn fill_slots(&mut self, target: usize) {
        while self.in_flight.len() < target {
            let Some(tracked) = self.pending.pop_front() else {
                break;
            };
            self.launch(tracked);
        }
    }

    fn launch(&mut self, mut tracked: Tracked) {
        tracked.job.begin_attempt();
        tracked.first_started.get_or_insert_with(Instant::now);
        self.concurrency.record_job_started();

        debug!(
            location_id = %tracked.job.location_id(),
            attempt = tracked.job.attempt_count,
            "▶️ Starting job"
        );

        let runner = Arc::clone(&self.runner);
        let job_timeout = self.config.job_timeout();
        let token = self.run_token.child_token();
        self.in_flight.spawn(async move {
            let spec = tracked.job.spec.clone();
            let attempt = AssertUnwindSafe(runner.run_job(&spec, token)).catch_unwind();
            let outcome = match tokio::time::timeout(job_timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(CollectionError::unknown(format!(
                    "collector panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Err(_) => Err(CollectionError::timeout(format!(
                    "no result within {job_timeout:?}"
                ))),
            };
            (tracked, outcome)
        });
    }

    fn complete_attempt(
        &mut self,
        mut tracked: Tracked,
        outcome: Result<CollectedLocation, CollectionError>,
        stopping: bool,
    ) {
        let error = match outcome {
            Ok(payload) => {
                debug!(
                    location_id = %tracked.job.location_id(),
                    attempt = tracked.job.attempt_count,
                    "✅ Job succeeded"
                );
                tracked.job.succeed(payload);
                self.emit(tracked);
                return;
            }
            Err(error) => error,
        };

        self.concurrency.record_failure();
        if error.kind == JobErrorKind::AuthRejected {
            tracked.auth_failures += 1;
        }

        let decision = if stopping {
            RetryDecision::GiveUp(GiveUpReason::Cancelled)
        } else {
            self.policy
                .decide(error.kind, tracked.job.attempt_count, tracked.auth_failures)
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    location_id = %tracked.job.location_id(),
                    attempt = tracked.job.attempt_count,
                    kind = %error.kind,
                    "🔄 Attempt failed ({}), retrying in {:?}",
                    error.message,
                    delay
                );
                self.stats.record_retry(tracked.job.location_id());
                tracked.job.schedule_retry(error);
                let location_id = tracked.job.location_id().to_string();
                let key = self.delayed.insert(tracked, delay);
                self.delayed_keys.insert(location_id, key);
            }
            RetryDecision::GiveUp(reason) => {
                warn!(
                    location_id = %tracked.job.location_id(),
                    attempts = tracked.job.attempt_count,
                    kind = %error.kind,
                    ?reason,
                    "❌ Job failed: {}",
                    error.message
                );
                tracked.job.fail(error);
                self.emit(tracked);
            }
        }
    }

    /// Queued retries become terminal failures; never-started jobs stay unreported.
    fn abandon_queued(&mut self) {
        let keys: Vec<_> = self.delayed_keys.drain().map(|(_, key)| key).collect();
        let mut abandoned: Vec<Tracked> = keys
            .iter()
            .map(|key| self.delayed.remove(key).into_inner())
            .collect();
        self.delayed.clear();

        let mut not_started = 0;
        for tracked in self.pending.drain(..) {
            if tracked.job.attempt_count > 0 {
                abandoned.push(tracked);
            } else {
                not_started += 1;
            }
        }

        for mut tracked in abandoned {
            let error = tracked
                .job
                .last_error
                .clone()
                .unwrap_or_else(|| CollectionError::unknown("retry abandoned"));
            tracked.job.fail(error);
            self.emit(tracked);
        }
        if not_started > 0 {
            info!("{} queued jobs will not start", not_started);
        }
    }

    fn check_systemic(&self) -> Option<SchedulerError> {
        let terminal = self.stats.terminal();
        if terminal < self.config.systemic_min_samples.max(1) {
            return None;
        }
        let threshold = self.config.systemic_failure_ratio;
        (self.stats.failure_ratio() > threshold).then(|| SchedulerError::SystemicFailure {
            failed: self.stats.failed(),
            terminal,
            threshold,
            report: Box::new(self.stats.clone().finish()),
        })
    }

    fn emit(&mut self, tracked: Tracked) {
        debug_assert!(tracked.job.status.is_terminal());
        let elapsed = tracked
            .first_started
            .map(|at| at.elapsed())
            .unwrap_or_default();
        let result = JobResult {
            job: tracked.job,
            elapsed,
        };
        self.stats.record_result(&result);
        if result.job.status == JobStatus::Failed {
            debug!(location_id = %result.location_id(), "Reporting failed job");
        }
        // Receiver may be gone when the caller only awaits `join`
        let _ = self.results_tx.send(result);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays a scripted outcome per attempt; succeeds once the script runs out
    struct ScriptedRunner {
        scripts: Mutex<HashMap<String, VecDeque<Result<(), CollectionError>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(scripts: Vec<(&str, Vec<Result<(), CollectionError>>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(id, steps)| (id.to_string(), steps.into_iter().collect()))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run_job(
            &self,
            job: &LocationJob,
            _cancel: CancellationToken,
        ) -> Result<CollectedLocation, CollectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&job.location_id)
                .and_then(VecDeque::pop_front);
            match step {
                Some(Err(e)) => Err(e),
                _ => Ok(CollectedLocation::default()),
            }
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            retry_base_delay_ms: 100,
            systemic_min_samples: 100,
            ..SchedulerConfig::default()
        }
    }

    fn jobs(ids: &[&str]) -> Vec<LocationJob> {
        ids.iter().map(|id| LocationJob::new(*id, *id, *id)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_submissions_are_ignored() {
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let mut scheduler = JobScheduler::new(config(), runner.clone(), ConcurrencyHandle::fixed(2));
        assert_eq!(scheduler.submit(jobs(&["1", "2", "1"])), 2);

        let run = scheduler.run(CancellationToken::new());
        let results: Vec<_> = run.collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_fails_without_retry() {
        let runner = Arc::new(ScriptedRunner::new(vec![(
            "7",
            vec![Err(CollectionError::no_data("nothing to report"))],
        )]));
        let mut scheduler = JobScheduler::new(config(), runner.clone(), ConcurrencyHandle::fixed(1));
        scheduler.submit(jobs(&["7"]));

        let mut run = scheduler.run(CancellationToken::new());
        let result = run.next().await.unwrap();
        assert_eq!(result.job.status, JobStatus::Failed);
        assert_eq!(result.job.attempt_count, 1);
        assert_eq!(result.job.error_kind(), Some(JobErrorKind::NoData));

        let report = run.join().await.unwrap();
        assert_eq!(report.retries, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_retries_once() {
        let runner = Arc::new(ScriptedRunner::new(vec![(
            "9",
            vec![
                Err(CollectionError::auth_rejected("session expired")),
                Err(CollectionError::auth_rejected("session expired")),
            ],
        )]));
        let mut scheduler = JobScheduler::new(config(), runner.clone(), ConcurrencyHandle::fixed(1));
        scheduler.submit(jobs(&["9"]));

        let results: Vec<_> = scheduler.run(CancellationToken::new()).collect().await;
        assert_eq!(results[0].job.status, JobStatus::Failed);
        assert_eq!(results[0].job.attempt_count, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_runner_is_classified_unknown() {
        struct PanickingRunner;

        #[async_trait]
        impl JobRunner for PanickingRunner {
            async fn run_job(
                &self,
                _job: &LocationJob,
                _cancel: CancellationToken,
            ) -> Result<CollectedLocation, CollectionError> {
                panic!("dashboard layout changed");
            }
        }

        let mut scheduler = JobScheduler::new(
            SchedulerConfig { max_attempts: 1, ..config() },
            Arc::new(PanickingRunner),
            ConcurrencyHandle::fixed(1),
        );
        scheduler.submit(jobs(&["3"]));
        let results: Vec<_> = scheduler.run(CancellationToken::new()).collect().await;
        assert_eq!(results[0].job.error_kind(), Some(JobErrorKind::Unknown));
        assert!(
            results[0]
                .job
                .last_error
                .as_ref()
                .unwrap()
                .message
                .contains("dashboard layout changed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_times_out() {
        struct SlowRunner;

        #[async_trait]
        impl JobRunner for SlowRunner {
            async fn run_job(
                &self,
                _job: &LocationJob,
                _cancel: CancellationToken,
            ) -> Result<CollectedLocation, CollectionError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(CollectedLocation::default())
            }
        }

        let mut scheduler = JobScheduler::new(
            SchedulerConfig {
                max_attempts: 2,
                job_timeout_ms: 1_000,
                ..config()
            },
            Arc::new(SlowRunner),
            ConcurrencyHandle::fixed(1),
        );
        scheduler.submit(jobs(&["5"]));
        let mut run = scheduler.run(CancellationToken::new());
        let result = run.next().await.unwrap();
        assert_eq!(result.job.error_kind(), Some(JobErrorKind::Timeout));
        assert_eq!(result.job.attempt_count, 2);
        assert_eq!(run.join().await.unwrap().retries, 1);
    }
}

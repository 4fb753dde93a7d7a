//! Scheduler behaviour under retries, pool limits, systemic failure and cancellation
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use shelf_sentinel::collection::{
    ConcurrencyController, ConcurrencyHandle, JobRunner, JobScheduler, ResourceSample, ResourceSampler,
    RetryPolicy, SampleError, SchedulerError,
};
use shelf_sentinel::domain::{CollectedLocation, CollectionError, JobErrorKind, JobStatus, LocationJob};
use shelf_sentinel::infrastructure::config::{ConcurrencyConfig, SchedulerConfig};

/// Each attempt sleeps `work`, then replays the next scripted error for the location
struct FakeDashboard {
    work: Duration,
    scripts: Mutex<HashMap<String, VecDeque<CollectionError>>>,
    fail_all: Option<CollectionError>,
    started: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeDashboard {
    fn new(work: Duration) -> Self {
        Self {
            work,
            scripts: Mutex::new(HashMap::new()),
            fail_all: None,
            started: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn script(self, location_id: &str, errors: Vec<CollectionError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(location_id.to_string(), errors.into_iter().collect());
        self
    }
}

#[async_trait]
impl JobRunner for FakeDashboard {
    async fn run_job(
        &self,
        job: &LocationJob,
        _cancel: CancellationToken,
    ) -> Result<CollectedLocation, CollectionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        tokio::time::sleep(self.work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = &self.fail_all {
            return Err(error.clone());
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&job.location_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(error),
            None => Ok(CollectedLocation::default()),
        }
    }
}

/// Idle until `overloaded` is set, then pinned CPU
#[derive(Default)]
struct ScriptedMachine {
    overloaded: AtomicBool,
}

#[async_trait]
impl ResourceSampler for ScriptedMachine {
    async fn sample(&self) -> Result<ResourceSample, SampleError> {
        let cpu = if self.overloaded.load(Ordering::SeqCst) { 95.0 } else { 20.0 };
        Ok(ResourceSample::now(cpu, 30.0))
    }
}

fn locations(count: usize) -> Vec<LocationJob> {
    (1..=count)
        .map(|n| LocationJob::new(format!("loc{n}"), format!("Store {n}"), format!("key-{n}")))
        .collect()
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_attempts: 3,
        systemic_min_samples: 1_000,
        ..SchedulerConfig::default()
    }
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)).without_jitter()
}

#[tokio::test(start_paused = true)]
async fn timeout_twice_then_success_on_third_attempt() {
    let runner = Arc::new(FakeDashboard::new(Duration::from_millis(10)).script(
        "loc2",
        vec![
            CollectionError::timeout("page did not settle"),
            CollectionError::timeout("page did not settle"),
        ],
    ));
    let mut scheduler = JobScheduler::new(scheduler_config(), runner.clone(), ConcurrencyHandle::fixed(3))
        .with_retry_policy(quick_policy());
    scheduler.submit(locations(3));

    let mut run = scheduler.run(CancellationToken::new());
    let mut results = HashMap::new();
    while let Some(result) = run.next().await {
        results.insert(result.location_id().to_string(), result);
    }
    let report = run.join().await.unwrap();

    let loc2 = &results["loc2"];
    assert_eq!(loc2.job.status, JobStatus::Succeeded);
    assert_eq!(loc2.job.attempt_count, 3);
    assert_eq!(results["loc1"].job.attempt_count, 1);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.retries, 2);
    assert_eq!(report.retried_locations, vec!["loc2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn every_submitted_job_is_reported_exactly_once() {
    let mut runner = FakeDashboard::new(Duration::from_millis(25));
    for n in (1..=60).step_by(4) {
        runner = runner.script(&format!("loc{n}"), vec![CollectionError::navigation_failed("menu missing"); 5]);
    }
    for n in (2..=60).step_by(7) {
        runner = runner.script(&format!("loc{n}"), vec![CollectionError::no_data("closed today")]);
    }
    for n in (3..=60).step_by(9) {
        runner = runner.script(&format!("loc{n}"), vec![CollectionError::auth_rejected("signed out")]);
    }

    let mut scheduler = JobScheduler::new(scheduler_config(), Arc::new(runner), ConcurrencyHandle::fixed(5))
        .with_retry_policy(quick_policy());
    assert_eq!(scheduler.submit(locations(60)), 60);

    let mut run = scheduler.run(CancellationToken::new());
    let mut seen = HashSet::new();
    while let Some(result) = run.next().await {
        assert!(result.job.status.is_terminal());
        assert!(seen.insert(result.location_id().to_string()), "duplicate result");
    }
    let report = run.join().await.unwrap();

    assert_eq!(seen.len(), 60);
    assert_eq!(report.succeeded + report.failed, 60);
    assert_eq!(report.not_started, 0);
    assert!(report.failures_by_kind[&JobErrorKind::NavigationFailed].contains(&"loc1".to_string()));
    assert!(report.failures_by_kind[&JobErrorKind::NoData].contains(&"loc2".to_string()));
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_the_concurrency_target() {
    let runner = Arc::new(FakeDashboard::new(Duration::from_millis(50)));
    let mut scheduler = JobScheduler::new(scheduler_config(), runner.clone(), ConcurrencyHandle::fixed(3));
    scheduler.submit(locations(20));

    let results: Vec<_> = scheduler.run(CancellationToken::new()).collect().await;

    assert_eq!(results.len(), 20);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn universal_failure_aborts_the_run() {
    let runner = Arc::new(FakeDashboard {
        fail_all: Some(CollectionError::navigation_failed("dashboard unreachable")),
        ..FakeDashboard::new(Duration::from_millis(10))
    });
    let config = SchedulerConfig {
        max_attempts: 1,
        systemic_failure_ratio: 0.5,
        systemic_min_samples: 5,
        ..SchedulerConfig::default()
    };
    let mut scheduler = JobScheduler::new(config, runner.clone(), ConcurrencyHandle::fixed(2));
    scheduler.submit(locations(40));

    let mut run = scheduler.run(CancellationToken::new());
    let mut emitted = 0;
    while run.next().await.is_some() {
        emitted += 1;
    }

    match run.join().await {
        Err(SchedulerError::SystemicFailure { failed, terminal, report, .. }) => {
            assert_eq!(failed, terminal);
            assert!(terminal >= 5);
            assert!(report.not_started > 0);
            assert_eq!(report.terminal(), emitted);
        }
        other => panic!("expected systemic failure, got {other:?}"),
    }
    assert!(runner.started.load(Ordering::SeqCst) < 40);
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_in_flight_jobs_finish_and_starts_nothing_new() {
    let runner = Arc::new(FakeDashboard::new(Duration::from_secs(1)));
    let mut scheduler = JobScheduler::new(scheduler_config(), runner.clone(), ConcurrencyHandle::fixed(2));
    scheduler.submit(locations(10));

    let cancel = CancellationToken::new();
    let mut run = scheduler.run(cancel.clone());

    let trigger = {
        let cancel = cancel.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            cancel.cancel();
            runner.started.load(Ordering::SeqCst)
        })
    };

    let mut completed = Vec::new();
    while let Some(result) = run.next().await {
        completed.push(result);
    }
    let report = run.join().await.unwrap();
    let started_at_cancel = trigger.await.unwrap();

    assert_eq!(runner.started.load(Ordering::SeqCst), started_at_cancel);
    assert_eq!(completed.len(), started_at_cancel);
    assert!(completed.iter().all(|r| r.job.status == JobStatus::Succeeded));
    assert_eq!(report.not_started, 10 - started_at_cancel);
}

#[tokio::test(start_paused = true)]
async fn pool_follows_the_controller_target_without_cancelling_running_jobs() {
    let (controller, handle) = ConcurrencyController::new(ConcurrencyConfig {
        adaptive: true,
        initial: 1,
        min: 1,
        max: 4,
        step: 1,
        sample_interval_ms: 100,
        cooldown_ms: 200,
        ..ConcurrencyConfig::default()
    });
    let machine = Arc::new(ScriptedMachine::default());
    let controller_stop = CancellationToken::new();
    let controller_task = tokio::spawn(controller.run(machine.clone(), controller_stop.clone()));

    let runner = Arc::new(FakeDashboard::new(Duration::from_secs(5)));
    let mut scheduler = JobScheduler::new(scheduler_config(), runner.clone(), handle.clone());
    scheduler.submit(locations(8));
    let mut run = scheduler.run(CancellationToken::new());

    let timeline = async {
        // Idle machine: target climbs one step per cooldown up to the ceiling
        tokio::time::sleep(Duration::from_secs(1)).await;
        let raised = (handle.target(), runner.peak.load(Ordering::SeqCst));

        // Overload: target walks back to the floor while four jobs still run
        machine.overloaded.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let lowered = (
            handle.target(),
            runner.started.load(Ordering::SeqCst),
            runner.running.load(Ordering::SeqCst),
        );

        // The first four finish near 5.4s; only then does one more start
        tokio::time::sleep(Duration::from_secs(4)).await;
        let drained = (
            runner.started.load(Ordering::SeqCst),
            runner.running.load(Ordering::SeqCst),
        );
        controller_stop.cancel();
        (raised, lowered, drained)
    };
    let collect = async {
        let mut succeeded = 0;
        while let Some(result) = run.next().await {
            if result.is_success() {
                succeeded += 1;
            }
        }
        succeeded
    };
    let ((raised, lowered, drained), succeeded) = tokio::join!(timeline, collect);
    let report = run.join().await.unwrap();

    assert_eq!(raised, (4, 4));
    assert_eq!(lowered, (1, 4, 4));
    assert_eq!(drained, (5, 1));
    assert_eq!(runner.peak.load(Ordering::SeqCst), 4);
    assert_eq!(succeeded, 8);
    assert_eq!(report.succeeded, 8);
    assert_eq!(controller_task.await.unwrap().current_target, 1);
}

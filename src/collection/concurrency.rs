//! # Adaptive Concurrency Controller
//!
//! Converts resource samples into a target worker-pool size. The controller is a
//! discrete step controller: one step down under resource pressure, one step up
//! when there is headroom, and a halving when recent job failures pile up. Every
//! change starts a cooldown during which the target is held.
//!
//! The controller task is the only writer of [`ConcurrencyState`]; the scheduler
//! observes the published target through a [`ConcurrencyHandle`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infrastructure::config::ConcurrencyConfig;

/// One CPU/memory reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub taken_at: Instant,
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

impl ResourceSample {
    pub fn now(cpu_percent: f32, mem_percent: f32) -> Self {
        Self {
            taken_at: Instant::now(),
            cpu_percent,
            mem_percent,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SampleError {
    #[error("Resource API unavailable: {0}")]
    Unavailable(String),

    #[error("Sampling timed out")]
    Timeout,
}

/// Platform resource sampling API
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample, SampleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Steady,
    Up,
    Down,
}

/// Process-lifetime controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyState {
    pub current_target: usize,
    pub last_change: Option<Instant>,
    pub direction: Direction,
}

impl ConcurrencyState {
    #[must_use]
    pub fn initial(config: &ConcurrencyConfig) -> Self {
        Self {
            current_target: config.initial.clamp(config.min, config.max),
            last_change: None,
            direction: Direction::Steady,
        }
    }

    /// Applies a decision, returning the new target when it changed.
    pub fn apply(&mut self, decision: Decision, now: Instant) -> Option<usize> {
        match decision {
            Decision::Hold(_) => None,
            Decision::Change { to, direction, .. } => {
                self.current_target = to;
                self.direction = direction;
                self.last_change = Some(now);
                Some(to)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    WithinBand,
    Cooldown,
    AtFloor,
    AtCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    ResourcePressure,
    ResourceHeadroom,
    FailurePressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold(HoldReason),
    Change {
        from: usize,
        to: usize,
        direction: Direction,
        cause: ChangeCause,
    },
}

/// Job starts and failures observed inside the failure window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailurePressure {
    pub started: usize,
    pub failures: usize,
}

impl FailurePressure {
    #[must_use]
    pub fn exceeds(&self, threshold: f64) -> bool {
        if self.failures == 0 {
            return false;
        }
        let rate = self.failures as f64 / self.started.max(1) as f64;
        rate > threshold
    }
}

/// Pure decision step.
#[must_use]
pub fn decide(
    config: &ConcurrencyConfig,
    state: &ConcurrencyState,
    sample: &ResourceSample,
    pressure: FailurePressure,
    now: Instant,
) -> Decision {
    let current = state.current_target;
    let overloaded = sample.cpu_percent > config.cpu_upper_percent
        || sample.mem_percent > config.mem_upper_percent;
    let idle = sample.cpu_percent < config.cpu_lower_percent
        && sample.mem_percent < config.mem_lower_percent;
    let failing = pressure.exceeds(config.failure_rate_threshold);

    if !(overloaded || idle || failing) {
        return Decision::Hold(HoldReason::WithinBand);
    }

    let cooling = state
        .last_change
        .is_some_and(|at| now.saturating_duration_since(at) < config.cooldown());
    if cooling {
        return Decision::Hold(HoldReason::Cooldown);
    }

    if overloaded || failing {
        if current <= config.min {
            return Decision::Hold(HoldReason::AtFloor);
        }
        let (to, cause) = if failing {
            ((current / 2).max(config.min), ChangeCause::FailurePressure)
        } else {
            (
                current.saturating_sub(config.step).max(config.min),
                ChangeCause::ResourcePressure,
            )
        };
        return Decision::Change {
            from: current,
            to,
            direction: Direction::Down,
            cause,
        };
    }

    if current >= config.max {
        return Decision::Hold(HoldReason::AtCeiling);
    }
    Decision::Change {
        from: current,
        to: (current + config.step).min(config.max),
        direction: Direction::Up,
        cause: ChangeCause::ResourceHeadroom,
    }
}

#[derive(Debug, Clone, Copy)]
enum PoolEvent {
    Started(Instant),
    Failed(Instant),
}

/// Read side of the controller, shared with the scheduler
#[derive(Debug, Clone)]
pub struct ConcurrencyHandle {
    target_rx: watch::Receiver<usize>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
}

impl ConcurrencyHandle {
    /// Handle with a constant target and no controller behind it
    #[must_use]
    pub fn fixed(target: usize) -> Self {
        let (_target_tx, target_rx) = watch::channel(target.max(1));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        Self {
            target_rx,
            events_tx,
        }
    }

    #[must_use]
    pub fn target(&self) -> usize {
        *self.target_rx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.target_rx.clone()
    }

    pub fn record_job_started(&self) {
        let _ = self.events_tx.send(PoolEvent::Started(Instant::now()));
    }

    pub fn record_failure(&self) {
        let _ = self.events_tx.send(PoolEvent::Failed(Instant::now()));
    }
}

/// Single writer of the concurrency target
pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    state: ConcurrencyState,
    target_tx: watch::Sender<usize>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    started: VecDeque<Instant>,
    failures: VecDeque<Instant>,
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> (Self, ConcurrencyHandle) {
        let state = ConcurrencyState::initial(&config);
        let (target_tx, target_rx) = watch::channel(state.current_target);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            state,
            target_tx,
            events_rx,
            started: VecDeque::new(),
            failures: VecDeque::new(),
        };
        let handle = ConcurrencyHandle {
            target_rx,
            events_tx,
        };
        (controller, handle)
    }

    #[must_use]
    pub const fn state(&self) -> ConcurrencyState {
        self.state
    }

    /// Feeds one sample through the policy and publishes any change.
    pub fn observe(&mut self, sample: &ResourceSample, now: Instant) -> Decision {
        let pressure = self.failure_pressure(now);
        let decision = decide(&self.config, &self.state, sample, pressure, now);

        if let Decision::Change {
            from,
            to,
            direction,
            cause,
        } = decision
        {
            info!(
                "🔄 Concurrency target {} -> {} ({:?}, {:?}, cpu {:.1}%, mem {:.1}%)",
                from, to, direction, cause, sample.cpu_percent, sample.mem_percent
            );
            if cause == ChangeCause::FailurePressure {
                // The halving answers the failures seen so far
                self.failures.clear();
                self.started.clear();
            }
        } else {
            debug!(?decision, cpu = sample.cpu_percent, mem = sample.mem_percent, "Concurrency held");
        }

        if let Some(target) = self.state.apply(decision, now) {
            self.target_tx.send_replace(target);
        }
        decision
    }

    fn failure_pressure(&mut self, now: Instant) -> FailurePressure {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                PoolEvent::Started(at) => self.started.push_back(at),
                PoolEvent::Failed(at) => self.failures.push_back(at),
            }
        }
        let window = self.config.failure_window();
        for events in [&mut self.started, &mut self.failures] {
            while events
                .front()
                .is_some_and(|at| now.saturating_duration_since(*at) > window)
            {
                events.pop_front();
            }
        }
        FailurePressure {
            started: self.started.len(),
            failures: self.failures.len(),
        }
    }

    /// Sampling loop. Runs until cancelled and returns the final state.
    pub async fn run(
        mut self,
        sampler: Arc<dyn ResourceSampler>,
        cancel: CancellationToken,
    ) -> ConcurrencyState {
        if !self.config.adaptive {
            info!("Adaptive concurrency disabled, target fixed at {}", self.state.current_target);
            cancel.cancelled().await;
            return self.state;
        }

        let mut ticker = interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "🚀 Concurrency controller started (target {}, bounds [{}, {}])",
            self.state.current_target, self.config.min, self.config.max
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match timeout(self.config.sample_interval(), sampler.sample()).await {
                        Ok(Ok(sample)) => {
                            self.observe(&sample, Instant::now());
                        }
                        Ok(Err(e)) => warn!("⚠️ Resource sampling failed, holding target: {}", e),
                        Err(_) => warn!("⚠️ {}, holding target", SampleError::Timeout),
                    }
                }
            }
        }

        info!("🛑 Concurrency controller stopped at target {}", self.state.current_target);
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn config() -> ConcurrencyConfig {
        ConcurrencyConfig {
            initial: 4,
            min: 1,
            max: 6,
            cooldown_ms: 10_000,
            ..ConcurrencyConfig::default()
        }
    }

    fn sample(cpu: f32, mem: f32) -> ResourceSample {
        ResourceSample::now(cpu, mem)
    }

    #[test]
    fn test_overload_steps_down() {
        let config = config();
        let state = ConcurrencyState::initial(&config);
        let now = Instant::now();
        let decision = decide(&config, &state, &sample(95.0, 40.0), FailurePressure::default(), now);
        assert_eq!(
            decision,
            Decision::Change {
                from: 4,
                to: 3,
                direction: Direction::Down,
                cause: ChangeCause::ResourcePressure
            }
        );
    }

    #[test]
    fn test_memory_pressure_alone_steps_down() {
        let config = config();
        let state = ConcurrencyState::initial(&config);
        let decision = decide(
            &config,
            &state,
            &sample(10.0, 93.0),
            FailurePressure::default(),
            Instant::now(),
        );
        assert!(matches!(decision, Decision::Change { to: 3, .. }));
    }

    #[test]
    fn test_headroom_steps_up_only_after_cooldown() {
        let config = config();
        let mut state = ConcurrencyState::initial(&config);
        let start = Instant::now();
        state.last_change = Some(start);

        let held = decide(&config, &state, &sample(20.0, 30.0), FailurePressure::default(), start + Duration::from_secs(5));
        assert_eq!(held, Decision::Hold(HoldReason::Cooldown));

        let raised = decide(&config, &state, &sample(20.0, 30.0), FailurePressure::default(), start + Duration::from_secs(10));
        assert!(matches!(raised, Decision::Change { to: 5, direction: Direction::Up, .. }));
    }

    #[test]
    fn test_mid_band_holds() {
        let config = config();
        let state = ConcurrencyState::initial(&config);
        let decision = decide(&config, &state, &sample(75.0, 50.0), FailurePressure::default(), Instant::now());
        assert_eq!(decision, Decision::Hold(HoldReason::WithinBand));
    }

    #[test]
    fn test_bounds_hold_at_floor_and_ceiling() {
        let config = config();
        let mut state = ConcurrencyState::initial(&config);
        state.current_target = config.min;
        let floor = decide(&config, &state, &sample(99.0, 99.0), FailurePressure::default(), Instant::now());
        assert_eq!(floor, Decision::Hold(HoldReason::AtFloor));

        state.current_target = config.max;
        let ceiling = decide(&config, &state, &sample(1.0, 1.0), FailurePressure::default(), Instant::now());
        assert_eq!(ceiling, Decision::Hold(HoldReason::AtCeiling));
    }

    #[test]
    fn test_failure_pressure_halves_target() {
        let config = config();
        let state = ConcurrencyState::initial(&config);
        let pressure = FailurePressure { started: 10, failures: 3 };
        let decision = decide(&config, &state, &sample(10.0, 10.0), pressure, Instant::now());
        assert_eq!(
            decision,
            Decision::Change {
                from: 4,
                to: 2,
                direction: Direction::Down,
                cause: ChangeCause::FailurePressure
            }
        );
    }

    #[tokio::test]
    async fn test_observe_publishes_to_handle() {
        let (mut controller, handle) = ConcurrencyController::new(config());
        let rx = handle.subscribe();
        controller.observe(&sample(20.0, 20.0), Instant::now());
        assert_eq!(handle.target(), 5);
        assert_eq!(*rx.borrow(), 5);
        assert_eq!(controller.state().direction, Direction::Up);
    }

    #[tokio::test]
    async fn test_recorded_failures_reach_controller() {
        let (mut controller, handle) = ConcurrencyController::new(config());
        handle.record_job_started();
        handle.record_job_started();
        handle.record_failure();
        let decision = controller.observe(&sample(75.0, 50.0), Instant::now());
        assert!(matches!(decision, Decision::Change { cause: ChangeCause::FailurePressure, to: 2, .. }));
    }

    struct FailingSampler;

    #[async_trait]
    impl ResourceSampler for FailingSampler {
        async fn sample(&self) -> Result<ResourceSample, SampleError> {
            Err(SampleError::Unavailable("no /proc".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_failure_holds_target() {
        let (controller, handle) = ConcurrencyController::new(config());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.run(Arc::new(FailingSampler), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        let state = task.await.unwrap();
        assert_eq!(state.current_target, 4);
        assert_eq!(handle.target(), 4);
    }

    proptest! {
        #[test]
        fn prop_target_stays_in_bounds_and_respects_cooldown(
            steps in proptest::collection::vec((0.0f32..100.0, 0.0f32..100.0, 0u64..20_000, 0usize..5), 1..80)
        ) {
            let config = config();
            let mut state = ConcurrencyState::initial(&config);
            let mut now = Instant::now();
            let mut last_change: Option<Instant> = None;

            for (cpu, mem, gap_ms, failures) in steps {
                now += Duration::from_millis(gap_ms);
                let pressure = FailurePressure { started: 4, failures };
                let decision = decide(&config, &state, &ResourceSample { taken_at: now, cpu_percent: cpu, mem_percent: mem }, pressure, now);
                if state.apply(decision, now).is_some() {
                    if let Some(previous) = last_change {
                        prop_assert!(now.duration_since(previous) >= config.cooldown());
                    }
                    last_change = Some(now);
                }
                prop_assert!(state.current_target >= config.min);
                prop_assert!(state.current_target <= config.max);
            }
        }
    }
}

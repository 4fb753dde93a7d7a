//! # Reporting Cycle
//!
//! Wires one end-to-end run: the concurrency controller sizes the worker pool,
//! the scheduler collects every location, flagged items stream into the
//! enrichment pipeline, and the aggregator builds the report once both the
//! scheduler and the pipeline have drained.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collection::{
    ConcurrencyController, JobRunner, JobScheduler, ResourceSampler, RunReport, SchedulerError,
};
use crate::domain::{CycleId, LocationJob};
use crate::enrichment::{AuthContext, AuthError, EnrichmentPipeline, InventoryLookup};
use crate::infrastructure::config::AppConfig;
use crate::reporting::{AggregateReport, Aggregator, BatchedDelivery, DeliveryStats, NotificationSink};

/// Everything one cycle produced
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub run: RunReport,
    pub aggregate: AggregateReport,
    pub delivery: DeliveryStats,
    /// Items handed to the enrichment pipeline after per-cycle dedupe
    pub enriched_items: usize,
    pub final_concurrency: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(
        "Cycle aborted on systemic failure: {failed} of {terminal} jobs failed (threshold {:.0}%)",
        .threshold * 100.0
    )]
    Systemic {
        failed: usize,
        terminal: usize,
        threshold: f64,
        /// Whatever was collected before the abort
        partial: Box<CycleReport>,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Collaborators of one cycle
pub struct ReportingCycle {
    config: AppConfig,
    runner: Arc<dyn JobRunner>,
    lookup: Arc<dyn InventoryLookup>,
    auth: Arc<AuthContext>,
    sink: Arc<dyn NotificationSink>,
    sampler: Arc<dyn ResourceSampler>,
}

impl ReportingCycle {
    pub fn new(
        config: AppConfig,
        runner: Arc<dyn JobRunner>,
        lookup: Arc<dyn InventoryLookup>,
        auth: Arc<AuthContext>,
        sink: Arc<dyn NotificationSink>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            config,
            runner,
            lookup,
            auth,
            sink,
            sampler,
        }
    }

    /// Runs one cycle over `jobs`.
    ///
    /// Cancelling `cancel` stops new jobs, retries and lookups; the report then
    /// holds only what completed. Only a systemic failure returns an error.
    pub async fn run(
        &self,
        jobs: Vec<LocationJob>,
        cancel: CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let cycle_id = CycleId::new();
        let started_at = Utc::now();
        info!("🚀 Reporting cycle {} started with {} locations", cycle_id, jobs.len());

        let (controller, concurrency) = ConcurrencyController::new(self.config.concurrency.clone());
        let controller_token = CancellationToken::new();
        let controller_task = tokio::spawn(
            controller.run(Arc::clone(&self.sampler), controller_token.clone()),
        );

        match self.auth.prime().await {
            Ok(snapshot) => debug!(mode = ?snapshot.mode(), "Lookup credentials ready"),
            Err(AuthError::NoSource) => debug!("No token source configured, lookups use the api key only"),
            Err(e) => warn!("⚠️ Could not obtain an initial bearer token: {}", e),
        }

        let mut scheduler =
            JobScheduler::new(self.config.scheduler.clone(), Arc::clone(&self.runner), concurrency);
        scheduler.submit(jobs);
        let mut run = scheduler.run(cancel.clone());

        let enrichment_token = cancel.child_token();
        let mut pipeline = EnrichmentPipeline::new(
            self.config.enrichment.clone(),
            Arc::clone(&self.lookup),
            Arc::clone(&self.auth),
            enrichment_token.clone(),
        );
        let mut aggregator = Aggregator::new(self.config.reporting.clone());
        let mut delivery =
            BatchedDelivery::new(Arc::clone(&self.sink), cycle_id, self.config.reporting.batch_size);

        while let Some(result) = run.next().await {
            if let Some(collected) = result.job.result.as_ref() {
                for item in &collected.flagged_items {
                    pipeline.submit(item);
                }
            }
            if let Some(summary) = aggregator.ingest_job(&result) {
                delivery.push(summary).await;
            }
        }

        let (run_report, systemic) = match run.join().await {
            Ok(report) => (report, None),
            Err(SchedulerError::SystemicFailure {
                failed,
                terminal,
                threshold,
                report,
            }) => {
                error!("❌ Systemic failure, abandoning enrichment");
                enrichment_token.cancel();
                (*report, Some((failed, terminal, threshold)))
            }
            Err(e) => {
                controller_token.cancel();
                enrichment_token.cancel();
                return Err(e.into());
            }
        };

        let enriched_items = pipeline.submitted();
        for result in pipeline.settle().await {
            aggregator.ingest_enrichment(result);
        }
        let aggregate = aggregator.finalize();

        delivery.flush().await;
        if systemic.is_none() {
            delivery.deliver_network(&aggregate.network.items).await;
        }
        delivery.deliver_job_summary(run_report.clone()).await;
        let delivery = delivery.finish().await;

        controller_token.cancel();
        let final_concurrency = match controller_task.await {
            Ok(state) => state.current_target,
            Err(e) => {
                warn!("⚠️ Concurrency controller task ended abnormally: {}", e);
                self.config.concurrency.initial
            }
        };

        let report = CycleReport {
            cycle_id,
            run: run_report,
            aggregate,
            delivery,
            enriched_items,
            final_concurrency,
            cancelled: cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
        };

        if let Some((failed, terminal, threshold)) = systemic {
            return Err(CycleError::Systemic {
                failed,
                terminal,
                threshold,
                partial: Box::new(report),
            });
        }

        info!(
            "✅ Reporting cycle {} finished: {}/{} locations succeeded, {} items enriched{}",
            report.cycle_id,
            report.run.succeeded,
            report.run.submitted,
            report.enriched_items,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }
}

//! Shelf Sentinel entrypoint: runs one reporting cycle and exits.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use shelf_sentinel::enrichment::{AuthContext, TokenSource};
use shelf_sentinel::infrastructure::{
    ConfigManager, DashboardJobRunner, HttpClient, HttpClientConfig, HttpTokenSource,
    InventoryApiClient, LogSink, SystemResourceSampler, WebhookSink, bootstrap_subscriber,
    init_logging_with_config, load_jobs,
};
use shelf_sentinel::reporting::NotificationSink;
use shelf_sentinel::{CycleError, ReportingCycle};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging; loading logs to the console until the
    // configured subscriber is installed
    let config_manager = ConfigManager::new()?;
    let config = config_manager
        .load_config()
        .with_subscriber(bootstrap_subscriber())
        .await?;
    init_logging_with_config(&config.logging)?;
    info!("🚀 Shelf Sentinel starting (config: {})", config_manager.config_path().display());

    // 2. Job source
    let jobs = load_jobs(&config.endpoints.jobs_file).await?;

    // 3. HTTP collaborators
    let endpoints = &config.endpoints;
    let dashboard_http = HttpClient::new(&HttpClientConfig {
        timeout: Duration::from_millis(endpoints.request_timeout_ms),
        ..HttpClientConfig::default()
    })
    .context("Failed to build dashboard client")?;
    let lookup_http = HttpClient::new(&HttpClientConfig {
        timeout: config.enrichment.lookup_timeout(),
        max_requests_per_second: config.enrichment.requests_per_second,
        cookie_store: false,
        ..HttpClientConfig::default()
    })
    .context("Failed to build inventory client")?;

    let runner = Arc::new(DashboardJobRunner::new(dashboard_http.clone(), endpoints)?);
    let lookup = Arc::new(InventoryApiClient::new(lookup_http.clone(), endpoints));
    let token_source = endpoints.token_url.as_ref().map(|url| -> Arc<dyn TokenSource> {
        Arc::new(HttpTokenSource::new(lookup_http.clone(), url.clone()))
    });
    let auth = Arc::new(AuthContext::new(endpoints.api_key.clone(), None, token_source));
    let sink: Arc<dyn NotificationSink> = match &endpoints.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(dashboard_http.clone(), url.clone())),
        None => {
            warn!("⚠️ No webhook configured, reports go to the log");
            Arc::new(LogSink)
        }
    };

    let cycle = ReportingCycle::new(
        config.clone(),
        runner,
        lookup,
        auth,
        sink,
        Arc::new(SystemResourceSampler::new()),
    );

    // 4. Ctrl-C stops new work; completed results are still reported
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight work");
            signal_token.cancel();
        }
    });

    // 5. Run
    match cycle.run(jobs, cancel).await {
        Ok(report) => {
            info!(
                "✅ Cycle complete: {} succeeded, {} failed, {} not started, {} batches delivered",
                report.run.succeeded,
                report.run.failed,
                report.run.not_started,
                report.delivery.delivered_batches
            );
            for (kind, failed) in &report.aggregate.failures {
                warn!("❌ {} locations failed with {}", failed.len(), kind);
            }
            if !report.aggregate.interrupted.is_empty() {
                warn!(
                    "🛑 {} locations were interrupted before completing",
                    report.aggregate.interrupted.len()
                );
            }
            Ok(())
        }
        Err(CycleError::Systemic { partial, .. }) => {
            error!(
                "❌ Cycle aborted: {} of {} finished jobs failed; check dashboard access",
                partial.run.failed,
                partial.run.terminal()
            );
            anyhow::bail!("systemic collection failure")
        }
        Err(e) => Err(e.into()),
    }
}

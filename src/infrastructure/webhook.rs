//! # Notification Sinks
//!
//! `WebhookSink` posts each report batch as a JSON document. `LogSink` writes
//! batches to the log instead, for runs without a webhook.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::infrastructure::http_client::{HttpClient, HttpError, body_excerpt};
use crate::reporting::{NotificationSink, ReportBatch, ReportPayload, SinkError};

pub struct WebhookSink {
    http: HttpClient,
    url: String,
}

impl WebhookSink {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, batch: ReportBatch) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&batch).map_err(|e| SinkError::Encoding(e.to_string()))?;
        let request = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        let response = self.http.send(request).await.map_err(|e| match e {
            HttpError::Timeout => SinkError::Transport("webhook timed out".to_string()),
            other => SinkError::Transport(other.to_string()),
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(sequence = batch.sequence, "Webhook accepted batch");
            Ok(())
        } else {
            debug!(
                sequence = batch.sequence,
                "Webhook rejected batch: {}",
                body_excerpt(response).await
            );
            Err(SinkError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Logs each batch instead of sending it anywhere
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, batch: ReportBatch) -> Result<(), SinkError> {
        match &batch.payload {
            ReportPayload::Locations(entries) => {
                for summary in entries {
                    info!(
                        location_id = %summary.location_id,
                        inf_rate = summary.metrics.item_not_found_rate,
                        "📍 {}: {} orders, {} flagged items",
                        summary.location_name,
                        summary.metrics.orders_shopped,
                        summary.top_items.len()
                    );
                }
            }
            ReportPayload::Network(items) => {
                for (rank, item) in items.iter().enumerate() {
                    info!(
                        identifier = %item.identifier,
                        "🏷️ #{} {} ({} occurrences at {} locations)",
                        rank + 1,
                        item.name.as_deref().unwrap_or("unnamed item"),
                        item.total_count,
                        item.contributors.len()
                    );
                }
            }
            ReportPayload::JobSummary(report) => {
                info!(
                    "📋 Jobs: {}/{} succeeded ({:.1}%), {} failed, {} not started",
                    report.succeeded,
                    report.submitted,
                    report.success_rate(),
                    report.failed,
                    report.not_started
                );
            }
        }
        Ok(())
    }
}

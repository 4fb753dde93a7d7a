//! # Notification Delivery
//!
//! The sink accepts one batch per message. Delivery is fire-and-forget from the
//! cycle's point of view: a failed batch is logged and counted, and the
//! aggregated report is left untouched.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::collection::RunReport;
use crate::domain::{CycleId, LocationSummary, NetworkItem};
use crate::reporting::batching::chunk_batches;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink rejected batch (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Sink transport error: {0}")]
    Transport(String),

    #[error("Failed to encode batch: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "entries")]
pub enum ReportPayload {
    Locations(Vec<LocationSummary>),
    Network(Vec<NetworkItem>),
    JobSummary(Box<RunReport>),
}

impl ReportPayload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Locations(entries) => entries.len(),
            Self::Network(entries) => entries.len(),
            Self::JobSummary(_) => 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One outbound message
#[derive(Debug, Clone, Serialize)]
pub struct ReportBatch {
    pub cycle_id: CycleId,
    /// Position of this batch within the cycle, starting at 0
    pub sequence: u32,
    pub payload: ReportPayload,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, batch: ReportBatch) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered_batches: u32,
    pub failed_batches: u32,
    pub entries_delivered: usize,
}

/// Buffers streamed location summaries and sends them in fixed-size batches.
pub struct BatchedDelivery {
    sink: Arc<dyn NotificationSink>,
    cycle_id: CycleId,
    batch_size: usize,
    buffer: Vec<LocationSummary>,
    sequence: u32,
    stats: DeliveryStats,
}

impl BatchedDelivery {
    pub fn new(sink: Arc<dyn NotificationSink>, cycle_id: CycleId, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            cycle_id,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            sequence: 0,
            stats: DeliveryStats::default(),
        }
    }

    /// Adds a summary, sending the buffer once it holds a full batch.
    pub async fn push(&mut self, summary: LocationSummary) {
        self.buffer.push(summary);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Sends any buffered summaries as a final, possibly short, batch.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let entries = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        self.send(ReportPayload::Locations(entries)).await;
    }

    pub async fn deliver_network(&mut self, items: &[NetworkItem]) {
        for chunk in chunk_batches(items, self.batch_size) {
            self.send(ReportPayload::Network(chunk)).await;
        }
    }

    pub async fn deliver_job_summary(&mut self, report: RunReport) {
        self.send(ReportPayload::JobSummary(Box::new(report))).await;
    }

    #[must_use]
    pub const fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Flushes the buffer and returns the final tallies.
    pub async fn finish(mut self) -> DeliveryStats {
        self.flush().await;
        info!(
            "📤 Delivery finished: {} batches sent, {} failed",
            self.stats.delivered_batches, self.stats.failed_batches
        );
        self.stats
    }

    async fn send(&mut self, payload: ReportPayload) {
        let entries = payload.len();
        let batch = ReportBatch {
            cycle_id: self.cycle_id,
            sequence: self.sequence,
            payload,
        };
        self.sequence += 1;

        match self.sink.deliver(batch).await {
            Ok(()) => {
                debug!(sequence = self.sequence - 1, entries, "Batch delivered");
                self.stats.delivered_batches += 1;
                self.stats.entries_delivered += entries;
            }
            Err(e) => {
                error!(sequence = self.sequence - 1, entries, "❌ Batch delivery failed: {}", e);
                self.stats.failed_batches += 1;
            }
        }
    }
}

//! Location list loader

use anyhow::{Context, Result, bail};
use std::path::Path;
use tracing::info;

use crate::domain::LocationJob;

/// Reads a JSON array of locations.
pub async fn load_jobs(path: &Path) -> Result<Vec<LocationJob>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read job list: {}", path.display()))?;
    let jobs: Vec<LocationJob> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job list: {}", path.display()))?;

    if let Some(job) = jobs.iter().find(|j| j.location_id.trim().is_empty()) {
        bail!("Job list contains a location without an id ({})", job.location_name);
    }

    info!("📄 Loaded {} locations from {}", jobs.len(), path.display());
    Ok(jobs)
}

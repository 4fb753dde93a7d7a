//! System resource sampling backed by `sysinfo`

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::System;

use crate::collection::concurrency::{ResourceSample, ResourceSampler, SampleError};

/// Samples global CPU and memory utilization of the host.
///
/// `sysinfo` needs two CPU refreshes to produce a usage figure, so the first
/// sample after construction may read close to zero.
#[derive(Clone)]
pub struct SystemResourceSampler {
    system: Arc<Mutex<System>>,
}

impl SystemResourceSampler {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SystemResourceSampler {
    async fn sample(&self) -> Result<ResourceSample, SampleError> {
        let system = Arc::clone(&self.system);
        let (cpu_percent, mem_percent) = tokio::task::spawn_blocking(move || {
            let mut system = system
                .lock()
                .map_err(|_| SampleError::Unavailable("sampler state poisoned".into()))?;
            system.refresh_cpu();
            system.refresh_memory();

            let total = system.total_memory();
            if total == 0 {
                return Err(SampleError::Unavailable("total memory reported as zero".into()));
            }
            let mem_percent = (system.used_memory() as f64 / total as f64 * 100.0) as f32;
            Ok((system.global_cpu_info().cpu_usage(), mem_percent))
        })
        .await
        .map_err(|e| SampleError::Unavailable(format!("sampling task failed: {e}")))??;

        Ok(ResourceSample::now(cpu_percent, mem_percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_reports_percentages() {
        let sampler = SystemResourceSampler::new();
        let sample = sampler.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&sample.mem_percent));
        assert!(sample.cpu_percent >= 0.0);
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use faas_common::{ResourceUsage, Sandbox, SandboxError};
use tracing::{debug, warn};

/// Source of resource figures for a live or just-terminated sandbox.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self, sandbox: &dyn Sandbox) -> Result<ResourceUsage, SandboxError>;
}

/// Default sampler: asks the sandbox's own provider for its accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderAccounting;

#[async_trait]
impl ResourceSampler for ProviderAccounting {
    async fn sample(&self, sandbox: &dyn Sandbox) -> Result<ResourceUsage, SandboxError> {
        sandbox.resource_usage().await
    }
}

/// Tracks the best-known CPU time and peak memory of one invocation.
///
/// Both figures only grow, so every observation is merged by maximum and a
/// field stays unmeasured until some source reports it.
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    last_known: ResourceUsage,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            sampler,
            last_known: ResourceUsage::unmeasured(),
        }
    }

    pub fn last_known(&self) -> ResourceUsage {
        self.last_known
    }

    /// Merges figures obtained elsewhere, e.g. reported by the program.
    pub fn observe(&mut self, usage: ResourceUsage) {
        self.last_known = ResourceUsage {
            cpu_seconds: max_of(self.last_known.cpu_seconds, usage.cpu_seconds, f64::max),
            peak_memory_bytes: max_of(
                self.last_known.peak_memory_bytes,
                usage.peak_memory_bytes,
                u64::max,
            ),
        };
    }

    /// Samples `sandbox` and returns the merged figures. A failed sample
    /// keeps the last known values.
    pub async fn sample(&mut self, sandbox: &dyn Sandbox) -> ResourceUsage {
        match self.sampler.sample(sandbox).await {
            Ok(usage) => {
                debug!(sandbox_id = %sandbox.id(), ?usage, "Sampled sandbox resources");
                self.observe(usage);
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id(), error = %e, "Resource metrics unavailable, keeping last known values");
            }
        }
        self.last_known
    }
}

fn max_of<T>(current: Option<T>, new: Option<T>, max: fn(T, T) -> T) -> Option<T> {
    match (current, new) {
        (Some(a), Some(b)) => Some(max(a, b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedSandbox;

    struct Broken;

    #[async_trait]
    impl ResourceSampler for Broken {
        async fn sample(&self, _: &dyn Sandbox) -> Result<ResourceUsage, SandboxError> {
            Err(SandboxError::Crashed("gone".into()))
        }
    }

    #[test]
    fn test_observe_merges_by_maximum() {
        let mut monitor = ResourceMonitor::new(Arc::new(ProviderAccounting));
        assert!(monitor.last_known().is_unmeasured());

        monitor.observe(ResourceUsage {
            cpu_seconds: Some(0.2),
            peak_memory_bytes: None,
        });
        monitor.observe(ResourceUsage::measured(0.1, 4096));

        assert_eq!(monitor.last_known(), ResourceUsage::measured(0.2, 4096));
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_last_known() {
        let sandbox = ScriptedSandbox::returning(serde_json::json!(1));
        let mut monitor = ResourceMonitor::new(Arc::new(Broken));
        monitor.observe(ResourceUsage::measured(0.5, 1024));

        let usage = monitor.sample(&sandbox).await;
        assert_eq!(usage, ResourceUsage::measured(0.5, 1024));
    }

    #[tokio::test]
    async fn test_provider_accounting_is_merged() {
        let sandbox = ScriptedSandbox::returning(serde_json::json!(1))
            .with_usage(ResourceUsage::measured(0.3, 8192));
        let mut monitor = ResourceMonitor::new(Arc::new(ProviderAccounting));
        monitor.observe(ResourceUsage::measured(0.1, 16384));

        let usage = monitor.sample(&sandbox).await;
        assert_eq!(usage, ResourceUsage::measured(0.3, 16384));
    }
}

use std::sync::Arc;

use chrono::Utc;
use faas_common::{
    ExecutionRequest, ExecutionResult, Function, InvocationOutcome, OutcomeKind, ResourceUsage,
    SandboxError, SandboxSpec,
};
use faas_metrics::{ExecutionRecord, MetricsAggregator};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::bootstrap;
use crate::monitor::{ProviderAccounting, ResourceMonitor, ResourceSampler};
use crate::registry::{ProviderRegistry, SandboxLease};
use crate::timeout::{timeout_message, Supervised, TimeoutSupervisor};
use crate::{ExecuteError, Result};

/// Default upper bound on the serialized input.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub max_input_bytes: usize,
    /// Also append a record when no sandbox could be allocated.
    pub record_provisioning_failures: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            record_provisioning_failures: false,
        }
    }
}

/// Drives one invocation through a fresh sandbox: lease, start, run under
/// the deadline, measure, tear down, record.
#[derive(Clone)]
pub struct InvocationRunner {
    registry: Arc<ProviderRegistry>,
    sampler: Arc<dyn ResourceSampler>,
    metrics: MetricsAggregator,
    config: RunnerConfig,
}

impl InvocationRunner {
    pub fn new(registry: Arc<ProviderRegistry>, metrics: MetricsAggregator) -> Self {
        Self {
            registry,
            sampler: Arc::new(ProviderAccounting),
            metrics,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Executes `function` once with `request.input`.
    ///
    /// Every outcome after a sandbox was allocated, including timeouts and
    /// start failures, comes back as `Ok` with a failed result and exactly
    /// one execution record. The invocation runs on its own task, so a
    /// caller that stops waiting does not skip teardown or recording.
    pub async fn execute(
        &self,
        function: &Function,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let input = self.prepare_input(function, request)?;
        let runner = self.clone();
        let function = function.clone();

        tokio::spawn(async move { runner.run_invocation(function, input).await })
            .await
            .map_err(|e| {
                error!(error = %e, "Invocation task failed");
                ExecuteError::Internal(format!("invocation task failed: {e}"))
            })?
    }

    fn prepare_input(&self, function: &Function, request: &ExecutionRequest) -> Result<Vec<u8>> {
        if request.function_id != function.id {
            return Err(ExecuteError::InvalidInput(format!(
                "request targets function {} but {} was supplied",
                request.function_id, function.id
            )));
        }
        if function.timeout == 0 {
            return Err(ExecuteError::InvalidInput(
                "timeout must be greater than zero".into(),
            ));
        }
        let input = serde_json::to_vec(&request.input)
            .map_err(|e| ExecuteError::InvalidInput(format!("input is not serializable: {e}")))?;
        if input.len() > self.config.max_input_bytes {
            return Err(ExecuteError::InvalidInput(format!(
                "input is {} bytes, limit is {}",
                input.len(),
                self.config.max_input_bytes
            )));
        }
        Ok(input)
    }

    #[instrument(skip(self, function, input), fields(function_id = %function.id, virtualization = %function.virtualization))]
    async fn run_invocation(&self, function: Function, input: Vec<u8>) -> Result<ExecutionResult> {
        let invocation_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let spec = SandboxSpec {
            invocation_id: invocation_id.clone(),
            function_id: function.id.clone(),
            language: function.language,
            program: bootstrap::wrap(function.language, &function.code),
            timeout: function.timeout_duration(),
        };

        let lease = match self.registry.lease(function.virtualization, &spec).await {
            Ok(lease) => lease,
            Err(e) if e.is_provisioning() => {
                error!(%invocation_id, error = %e, "No sandbox could be provisioned");
                if self.config.record_provisioning_failures {
                    self.record(ExecutionRecord::provisioning_failure(
                        &invocation_id,
                        &function.id,
                        function.virtualization,
                        started_at,
                        clock.elapsed(),
                        e.to_string(),
                    ))
                    .await;
                }
                return Err(ExecuteError::Provisioning(e));
            }
            Err(e) => {
                // allocated far enough to fail booting, but nothing to tear down
                let result = ExecutionResult::failed(
                    OutcomeKind::StartFailed,
                    e.to_string(),
                    clock.elapsed(),
                    ResourceUsage::unmeasured(),
                );
                self.finish(&invocation_id, &function, started_at, &result).await;
                return Ok(result);
            }
        };

        info!(%invocation_id, sandbox_id = %lease.sandbox().id(), "Sandbox acquired");
        let result = self.drive(lease, &spec, &input, clock).await;
        self.finish(&invocation_id, &function, started_at, &result).await;
        Ok(result)
    }

    /// Start, run, measure and release. Never returns without releasing.
    async fn drive(
        &self,
        mut lease: SandboxLease,
        spec: &SandboxSpec,
        input: &[u8],
        clock: Instant,
    ) -> ExecutionResult {
        let mut monitor = ResourceMonitor::new(self.sampler.clone());

        if let Err(e) = lease.sandbox_mut().start().await {
            warn!(sandbox_id = %lease.sandbox().id(), error = %e, "Sandbox failed to start");
            let usage = monitor.sample(lease.sandbox()).await;
            release(lease).await;
            return ExecutionResult::failed(
                OutcomeKind::StartFailed,
                start_failure_message(&e),
                clock.elapsed(),
                usage,
            );
        }

        let supervisor = TimeoutSupervisor::arm(spec.timeout);
        let supervised = supervisor.race(lease.sandbox_mut().run(input)).await;
        let elapsed = supervised.elapsed();

        let outcome = match supervised {
            Supervised::Disarmed {
                output: Ok(output), ..
            } => {
                let interpretation = bootstrap::interpret(&output);
                monitor.observe(interpretation.reported_usage);
                interpretation.outcome
            }
            Supervised::Disarmed { output: Err(e), .. } => {
                warn!(sandbox_id = %lease.sandbox().id(), error = %e, "Sandbox failed while running");
                let kind = match e {
                    SandboxError::StartFailed(_) => OutcomeKind::StartFailed,
                    _ => OutcomeKind::UserCodeError,
                };
                InvocationOutcome::Failed {
                    kind,
                    message: e.to_string(),
                }
            }
            Supervised::Fired { .. } => {
                warn!(sandbox_id = %lease.sandbox().id(), timeout_ms = spec.timeout.as_millis() as u64, "Invocation timed out, terminating sandbox");
                if let Err(e) = lease.sandbox_mut().terminate().await {
                    warn!(sandbox_id = %lease.sandbox().id(), error = %e, "Failed to terminate sandbox");
                }
                InvocationOutcome::Failed {
                    kind: OutcomeKind::Timeout,
                    message: timeout_message(spec.timeout),
                }
            }
        };

        let usage = monitor.sample(lease.sandbox()).await;
        release(lease).await;

        ExecutionResult {
            outcome,
            execution_time: elapsed,
            usage,
        }
    }

    async fn finish(
        &self,
        invocation_id: &str,
        function: &Function,
        started_at: chrono::DateTime<Utc>,
        result: &ExecutionResult,
    ) {
        info!(
            %invocation_id,
            success = result.success(),
            kind = ?result.kind(),
            execution_time_ms = result.execution_time_ms(),
            "Invocation finished"
        );
        self.record(ExecutionRecord::from_result(
            invocation_id,
            &function.id,
            function.virtualization,
            started_at,
            result,
        ))
        .await;
    }

    async fn record(&self, record: ExecutionRecord) {
        if let Err(e) = self.metrics.record(record).await {
            error!(error = %e, "Failed to append execution record");
        }
    }
}

async fn release(lease: SandboxLease) {
    if let Err(e) = lease.release().await {
        warn!(error = %e, "Failed to release sandbox");
    }
}

fn start_failure_message(error: &SandboxError) -> String {
    match error {
        SandboxError::StartFailed(_) => error.to_string(),
        other => format!("sandbox failed to start: {other}"),
    }
}

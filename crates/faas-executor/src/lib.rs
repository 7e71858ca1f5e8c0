use faas_common::SandboxError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the gateway)
pub use bollard;
pub use faas_common as common;

pub mod bootstrap;
pub mod docker;
pub mod firecracker;
pub mod monitor;
pub mod registry;
pub mod runner;
pub mod serializer;
pub mod test_utils;
pub mod timeout;

pub use docker::{DockerConfig, DockerProvider};
pub use firecracker::{FirecrackerConfig, FirecrackerProvider};
pub use monitor::{ProviderAccounting, ResourceMonitor, ResourceSampler};
pub use registry::{ProviderRegistry, SandboxLease};
pub use runner::{InvocationRunner, RunnerConfig};
pub use serializer::{EnvelopeMetrics, ResponseEnvelope};
pub use timeout::{Supervised, SupervisorState, TimeoutSupervisor};

/// Errors surfaced by [`InvocationRunner::execute`] instead of a result.
///
/// Everything that happens after a sandbox was allocated is reported as a
/// failed [`faas_common::ExecutionResult`], never through this type.
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Invalid invocation input: {0}")]
    InvalidInput(String),
    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] SandboxError),
    #[error("Internal executor error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecuteError>;

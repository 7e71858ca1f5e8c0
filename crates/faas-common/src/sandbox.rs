use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Language, ResourceUsage, Virtualization};

#[derive(Error, Debug)]
pub enum SandboxError {
    /// No free execution slot on this host.
    #[error("sandbox capacity exhausted: {0}")]
    Capacity(String),
    /// The provider could not allocate a context at all.
    #[error("sandbox provider failure: {0}")]
    Provider(String),
    /// The context was allocated but could not be booted or started.
    #[error("sandbox failed to start: {0}")]
    StartFailed(String),
    /// The context died while the invocation was running.
    #[error("sandbox crashed: {0}")]
    Crashed(String),
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether this error means no context could be allocated.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, SandboxError::Capacity(_) | SandboxError::Provider(_))
    }
}

/// Everything a provider needs to materialise one invocation's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub invocation_id: String,
    pub function_id: String,
    pub language: Language,
    /// Fully wrapped program, ready for the language interpreter.
    pub program: String,
    pub timeout: Duration,
}

/// Raw output of the sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub exit_code: Option<i64>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SandboxOutput {
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Capability to materialise isolated execution contexts of one technology.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn virtualization(&self) -> Virtualization;

    /// Allocates a context. Errors here are provisioning failures.
    async fn acquire(&self, spec: &SandboxSpec) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Cheap readiness probe used by health reporting.
    async fn available(&self) -> bool {
        true
    }
}

/// One isolated context hosting exactly one invocation.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn start(&mut self) -> Result<(), SandboxError>;

    /// Feeds `input` through the invocation channel and waits for the
    /// program to exit. Dropping the future abandons the wait, it does not
    /// stop the program; use [`Sandbox::terminate`] for that.
    async fn run(&mut self, input: &[u8]) -> Result<SandboxOutput, SandboxError>;

    /// Forcibly stops the sandboxed program.
    async fn terminate(&mut self) -> Result<(), SandboxError>;

    /// Resource accounting as seen by the provider.
    async fn resource_usage(&self) -> Result<ResourceUsage, SandboxError>;

    /// Tears the context down and reclaims its resources.
    async fn release(self: Box<Self>) -> Result<(), SandboxError>;
}

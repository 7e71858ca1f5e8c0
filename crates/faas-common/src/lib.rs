// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;
use thiserror::Error;
pub use uuid;

pub mod guest;
mod sandbox;

pub use guest::{GuestInvocation, GuestReport};
pub use sandbox::{Sandbox, SandboxError, SandboxOutput, SandboxProvider, SandboxSpec};

/// Timeout applied when a definition does not specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Function Definition Invalid: {0}")]
    DefinitionInvalid(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[serde(alias = "node")]
    Javascript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = FaasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "javascript" | "node" => Ok(Language::Javascript),
            other => Err(FaasError::DefinitionInvalid(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

/// Isolation mechanism backing a sandbox.
///
/// Aggregation keys on [`Virtualization::as_str`], so adding a variant here
/// needs no change on the metrics side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Virtualization {
    Docker,
    Firecracker,
}

impl Virtualization {
    pub const ALL: [Virtualization; 2] = [Virtualization::Docker, Virtualization::Firecracker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Virtualization::Docker => "docker",
            Virtualization::Firecracker => "firecracker",
        }
    }
}

impl Default for Virtualization {
    fn default() -> Self {
        Virtualization::Docker
    }
}

impl Display for Virtualization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Virtualization {
    type Err = FaasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Virtualization::Docker),
            "firecracker" => Ok(Virtualization::Firecracker),
            other => Err(FaasError::DefinitionInvalid(format!(
                "unsupported virtualization: {other}"
            ))),
        }
    }
}

/// A deployed function. Read-only to the execution harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: String,
    pub name: String,
    pub language: Language,
    pub code: String,
    /// Milliseconds, always positive for a valid definition.
    pub timeout: u64,
    pub virtualization: Virtualization,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        language: Language,
        code: impl Into<String>,
        timeout: u64,
        virtualization: Virtualization,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            language,
            code: code.into(),
            timeout,
            virtualization,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FaasError::DefinitionInvalid("name must not be empty".into()));
        }
        if self.code.trim().is_empty() {
            return Err(FaasError::DefinitionInvalid("code must not be empty".into()));
        }
        if self.timeout == 0 {
            return Err(FaasError::DefinitionInvalid(
                "timeout must be a positive number of milliseconds".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub function_id: String,
    #[serde(default = "empty_input")]
    pub input: Value,
}

fn empty_input() -> Value {
    Value::Object(Default::default())
}

impl ExecutionRequest {
    pub fn new(function_id: impl Into<String>, input: Value) -> Self {
        Self {
            function_id: function_id.into(),
            input,
        }
    }
}

/// CPU and peak memory of one invocation. `None` means unmeasured, which is
/// never the same thing as a measured zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_seconds: Option<f64>,
    pub peak_memory_bytes: Option<u64>,
}

impl ResourceUsage {
    pub fn unmeasured() -> Self {
        Self::default()
    }

    pub fn measured(cpu_seconds: f64, peak_memory_bytes: u64) -> Self {
        Self {
            cpu_seconds: Some(cpu_seconds),
            peak_memory_bytes: Some(peak_memory_bytes),
        }
    }

    pub fn is_unmeasured(&self) -> bool {
        self.cpu_seconds.is_none() && self.peak_memory_bytes.is_none()
    }

    /// Fills fields missing from `self` with the ones known in `fallback`.
    pub fn or(self, fallback: ResourceUsage) -> Self {
        Self {
            cpu_seconds: self.cpu_seconds.or(fallback.cpu_seconds),
            peak_memory_bytes: self.peak_memory_bytes.or(fallback.peak_memory_bytes),
        }
    }
}

/// How an invocation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    UserCodeError,
    Timeout,
    StartFailed,
    ProvisioningFailed,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Returned(Value),
    Failed { kind: OutcomeKind, message: String },
}

/// Result of one completed invocation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: InvocationOutcome,
    pub execution_time: Duration,
    pub usage: ResourceUsage,
}

impl ExecutionResult {
    pub fn returned(value: Value, execution_time: Duration, usage: ResourceUsage) -> Self {
        Self {
            outcome: InvocationOutcome::Returned(value),
            execution_time,
            usage,
        }
    }

    pub fn failed(
        kind: OutcomeKind,
        message: impl Into<String>,
        execution_time: Duration,
        usage: ResourceUsage,
    ) -> Self {
        Self {
            outcome: InvocationOutcome::Failed {
                kind,
                message: message.into(),
            },
            execution_time,
            usage,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Returned(_))
    }

    pub fn kind(&self) -> OutcomeKind {
        match &self.outcome {
            InvocationOutcome::Returned(_) => OutcomeKind::Success,
            InvocationOutcome::Failed { kind, .. } => *kind,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            InvocationOutcome::Returned(value) => Some(value),
            InvocationOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            InvocationOutcome::Returned(_) => None,
            InvocationOutcome::Failed { message, .. } => Some(message),
        }
    }

    pub fn execution_time_ms(&self) -> u64 {
        u64::try_from(self.execution_time.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutionResult(kind: {:?}, execution_time_ms: {}, usage: {:?})",
            self.kind(),
            self.execution_time_ms(),
            self.usage
        )
    }
}

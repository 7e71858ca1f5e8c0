/// Test utilities for conditional test execution and scripted sandboxes
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faas_common::{
    ResourceUsage, Sandbox, SandboxError, SandboxOutput, SandboxProvider, SandboxSpec,
    Virtualization,
};
use serde_json::{json, Value};

use crate::bootstrap::RESULT_MARKER;

pub fn has_docker() -> bool {
    // Check if docker command exists
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_firecracker() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }

    Command::new("firecracker")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_kvm() -> bool {
    cfg!(target_os = "linux") && std::path::Path::new("/dev/kvm").exists()
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_firecracker {
    () => {
        if !$crate::test_utils::has_firecracker() || !$crate::test_utils::has_kvm() {
            eprintln!("Test ignored: Firecracker not available (Linux with KVM required)");
            return;
        }
    };
}

/// What a scripted sandbox does when run.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reports `value` as the program's return value.
    Return(Value),
    /// Applies a function to the decoded input; `Err` becomes a raised
    /// exception.
    Compute(fn(Value) -> Result<Value, String>),
    /// Reports a raised exception with this message.
    Raise(String),
    /// Emits exactly this process output.
    Raw(SandboxOutput),
    /// Never finishes until terminated.
    Hang,
    /// `start` fails with this message.
    FailStart(String),
}

/// Lifecycle counters shared by a provider and every sandbox it hands out.
#[derive(Debug, Default)]
pub struct SandboxEvents {
    pub acquired: AtomicUsize,
    pub started: AtomicUsize,
    pub terminated: AtomicUsize,
    pub released: AtomicUsize,
}

impl SandboxEvents {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// In-process stand-in for a real provider.
#[derive(Clone)]
pub struct ScriptedProvider {
    virtualization: Virtualization,
    behavior: Behavior,
    delay: Duration,
    reported: Option<ResourceUsage>,
    accounting: Option<ResourceUsage>,
    acquire_error: Option<String>,
    available: bool,
    events: Arc<SandboxEvents>,
}

impl ScriptedProvider {
    pub fn new(virtualization: Virtualization, behavior: Behavior) -> Self {
        Self {
            virtualization,
            behavior,
            delay: Duration::ZERO,
            reported: None,
            accounting: None,
            acquire_error: None,
            available: true,
            events: Arc::new(SandboxEvents::default()),
        }
    }

    pub fn docker(behavior: Behavior) -> Self {
        Self::new(Virtualization::Docker, behavior)
    }

    pub fn firecracker(behavior: Behavior) -> Self {
        Self::new(Virtualization::Firecracker, behavior)
    }

    /// Provider whose `acquire` always fails.
    pub fn failing(virtualization: Virtualization, message: impl Into<String>) -> Self {
        let mut provider = Self::new(virtualization, Behavior::Return(Value::Null));
        provider.acquire_error = Some(message.into());
        provider
    }

    /// Simulated run time before the program reports.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Usage the simulated interpreter prints in its report.
    pub fn with_reported_usage(mut self, usage: ResourceUsage) -> Self {
        self.reported = Some(usage);
        self
    }

    /// Usage the simulated provider accounts for. Without it sampling fails.
    pub fn with_accounting(mut self, usage: ResourceUsage) -> Self {
        self.accounting = Some(usage);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn events(&self) -> Arc<SandboxEvents> {
        self.events.clone()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    fn virtualization(&self) -> Virtualization {
        self.virtualization
    }

    async fn acquire(&self, spec: &SandboxSpec) -> Result<Box<dyn Sandbox>, SandboxError> {
        if let Some(message) = &self.acquire_error {
            return Err(SandboxError::Provider(message.clone()));
        }
        self.events.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSandbox {
            id: format!("scripted-{}", spec.invocation_id),
            behavior: self.behavior.clone(),
            delay: self.delay,
            reported: self.reported,
            accounting: self.accounting,
            events: self.events.clone(),
        }))
    }

    async fn available(&self) -> bool {
        self.available
    }
}

pub struct ScriptedSandbox {
    id: String,
    behavior: Behavior,
    delay: Duration,
    reported: Option<ResourceUsage>,
    accounting: Option<ResourceUsage>,
    events: Arc<SandboxEvents>,
}

impl ScriptedSandbox {
    /// Standalone sandbox, mostly for exercising samplers.
    pub fn returning(value: Value) -> Self {
        Self {
            id: "scripted".into(),
            behavior: Behavior::Return(value),
            delay: Duration::ZERO,
            reported: None,
            accounting: None,
            events: Arc::new(SandboxEvents::default()),
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.accounting = Some(usage);
        self
    }

    fn report(&self, body: Value, exit_code: i64) -> SandboxOutput {
        let mut body = body;
        if let Some(usage) = self.reported {
            body["metrics"] = json!({
                "memory": usage.peak_memory_bytes,
                "cpu": usage.cpu_seconds,
            });
        }
        SandboxOutput {
            exit_code: Some(exit_code),
            stdout: format!("{RESULT_MARKER}{body}\n").into_bytes(),
            stderr: Vec::new(),
        }
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        if let Behavior::FailStart(message) = &self.behavior {
            return Err(SandboxError::StartFailed(message.clone()));
        }
        self.events.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&mut self, input: &[u8]) -> Result<SandboxOutput, SandboxError> {
        if matches!(self.behavior, Behavior::Hang) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let input: Value = serde_json::from_slice(input).unwrap_or(Value::Null);

        Ok(match &self.behavior {
            Behavior::Return(value) => self.report(json!({ "result": value }), 0),
            Behavior::Compute(f) => match f(input) {
                Ok(value) => self.report(json!({ "result": value }), 0),
                Err(message) => self.report(json!({ "error": message }), 1),
            },
            Behavior::Raise(message) => self.report(json!({ "error": message }), 1),
            Behavior::Raw(output) => output.clone(),
            Behavior::Hang | Behavior::FailStart(_) => SandboxOutput::default(),
        })
    }

    async fn terminate(&mut self) -> Result<(), SandboxError> {
        self.events.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, SandboxError> {
        self.accounting
            .ok_or_else(|| SandboxError::Provider("no accounting for scripted sandbox".into()))
    }

    async fn release(self: Box<Self>) -> Result<(), SandboxError> {
        self.events.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

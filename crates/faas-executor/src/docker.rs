use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, Stats,
    StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use faas_common::{
    FaasError, Language, ResourceUsage, Sandbox, SandboxError, SandboxOutput, SandboxProvider,
    SandboxSpec, Virtualization,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap;

pub const DEFAULT_PYTHON_IMAGE: &str = "python:3.9-slim";
pub const DEFAULT_NODE_IMAGE: &str = "node:16-slim";
pub const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub python_image: String,
    pub node_image: String,
    /// Hard memory limit per container. Swap is left unlimited.
    pub memory_limit_bytes: i64,
    pub working_dir: String,
    /// Runs containers without any network interface.
    pub network_disabled: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            python_image: DEFAULT_PYTHON_IMAGE.to_string(),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            working_dir: "/app".to_string(),
            network_disabled: true,
        }
    }
}

impl DockerConfig {
    pub fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python_image,
            Language::Javascript => &self.node_image,
        }
    }

    fn container_config(&self, spec: &SandboxSpec) -> Config<String> {
        Config {
            image: Some(self.image_for(spec.language).to_string()),
            cmd: Some(bootstrap::command(spec.language, &spec.program)),
            working_dir: Some(self.working_dir.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false), // Ensure TTY is false if using separate streams
            network_disabled: Some(self.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(self.memory_limit_bytes),
                memory_swap: Some(-1),
                network_mode: self.network_disabled.then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// One throwaway container per invocation.
#[derive(Clone)]
pub struct DockerProvider {
    docker: Arc<Docker>,
    config: DockerConfig,
}

impl DockerProvider {
    pub fn new(docker: Arc<Docker>, config: DockerConfig) -> Self {
        Self { docker, config }
    }

    /// Connects to the local daemon using the usual socket defaults.
    pub fn connect_local(config: DockerConfig) -> Result<Self, FaasError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| FaasError::Config(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self::new(Arc::new(docker), config))
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(%image, "Image not present locally, pulling");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| SandboxError::Provider(format!("failed to pull {image}: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn virtualization(&self) -> Virtualization {
        Virtualization::Docker
    }

    #[instrument(skip(self, spec), fields(invocation_id = %spec.invocation_id, function_id = %spec.function_id))]
    async fn acquire(&self, spec: &SandboxSpec) -> Result<Box<dyn Sandbox>, SandboxError> {
        let image = self.config.image_for(spec.language);
        self.ensure_image(image).await?;

        // Use a per-invocation container name to avoid conflicts
        let name = format!("faas-{}-{}", spec.function_id, spec.invocation_id);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                self.config.container_config(spec),
            )
            .await
            .map_err(|e| SandboxError::Provider(format!("container creation failed: {e}")))?;

        info!(container_id = %created.id, %name, %image, "Container created");
        Ok(Box::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id: created.id,
            attached: Mutex::new(None),
        }))
    }

    async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

pub struct DockerSandbox {
    docker: Arc<Docker>,
    container_id: String,
    attached: Mutex<Option<AttachContainerResults>>,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        // Attach streams BEFORE starting
        let attach_options = AttachContainerOptions::<String> {
            stream: Some(true),
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(&self.container_id, Some(attach_options))
            .await
            .map_err(|e| SandboxError::StartFailed(format!("attach failed: {e}")))?;
        *self.attached.get_mut() = Some(attached);

        self.docker
            .start_container(&self.container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        debug!(container_id = %self.container_id, "Container started");
        Ok(())
    }

    async fn run(&mut self, input: &[u8]) -> Result<SandboxOutput, SandboxError> {
        let AttachContainerResults {
            mut output,
            input: mut stdin,
        } = self
            .attached
            .get_mut()
            .take()
            .ok_or_else(|| SandboxError::StartFailed("container was not started".into()))?;

        let payload = input.to_vec();
        let container_id = self.container_id.clone();
        let stdin_handle = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                error!(error = %e, %container_id, "Failed to write payload to container stdin");
            }
            if let Err(e) = stdin.shutdown().await {
                error!(error = %e, %container_id, "Failed to shutdown container stdin stream");
            }
        });

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(entry) = output.next().await {
                match entry {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, container_id = %self.container_id, "Error reading container output stream");
                        break;
                    }
                }
            }
            (stdout, stderr)
        };

        let docker = self.docker.clone();
        let wait = async {
            let mut stream = docker.wait_container(
                &self.container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            stream.next().await
        };

        let ((stdout, stderr), waited) = tokio::join!(collect, wait);
        if let Err(e) = stdin_handle.await {
            warn!(error = %e, container_id = %self.container_id, "Stdin write task panicked");
        }

        let exit_code = match waited {
            Some(Ok(body)) => Some(body.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => return Err(SandboxError::Crashed(format!("container wait failed: {e}"))),
            None => return Err(SandboxError::Crashed("container wait stream ended unexpectedly".into())),
        };
        debug!(container_id = %self.container_id, ?exit_code, "Container exited");

        Ok(SandboxOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn terminate(&mut self) -> Result<(), SandboxError> {
        self.docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Crashed(format!("kill failed: {e}")))
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, SandboxError> {
        let mut stream = self.docker.stats(
            &self.container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(usage_from_stats(&stats)),
            Some(Err(e)) => Err(SandboxError::Provider(format!("stats failed: {e}"))),
            None => Err(SandboxError::Provider("stats stream was empty".into())),
        }
    }

    async fn release(self: Box<Self>) -> Result<(), SandboxError> {
        info!(container_id = %self.container_id, "Removing container");
        self.docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Provider(format!("container removal failed: {e}")))
    }
}

fn usage_from_stats(stats: &Stats) -> ResourceUsage {
    usage_from_sample(
        &stats.read,
        stats.cpu_stats.cpu_usage.total_usage,
        stats.memory_stats.max_usage.or(stats.memory_stats.usage),
    )
}

/// A container that already exited reports a zero `read` timestamp and an
/// empty memory block; only that counts as unmeasured. A zero reading from a
/// real sample is kept.
fn usage_from_sample(read: &str, cpu_total_ns: u64, memory_bytes: Option<u64>) -> ResourceUsage {
    let sampled = !read.is_empty() && !read.starts_with("0001-01-01");
    ResourceUsage {
        cpu_seconds: sampled.then(|| cpu_total_ns as f64 / 1e9),
        peak_memory_bytes: memory_bytes.filter(|_| sampled),
    }
}

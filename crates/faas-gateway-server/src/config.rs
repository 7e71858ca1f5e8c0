use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use faas_common::FaasError;
use faas_executor::runner::DEFAULT_MAX_INPUT_BYTES;
use faas_executor::{DockerConfig, FirecrackerConfig, RunnerConfig};
use faas_metrics::TimeRange;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_SANDBOXES: usize = 32;

/// Everything the gateway process needs, passed explicitly to each part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Execution slots shared by every provider.
    pub max_concurrent_sandboxes: usize,
    pub max_input_bytes: usize,
    pub record_provisioning_failures: bool,
    /// Used when a metrics query has no `timeRange`.
    pub default_time_range: TimeRange,
    pub docker: DockerConfig,
    /// Firecracker is only wired up when this section is present.
    pub firecracker: Option<FirecrackerConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_concurrent_sandboxes: DEFAULT_MAX_SANDBOXES,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            record_provisioning_failures: false,
            default_time_range: TimeRange::default(),
            docker: DockerConfig::default(),
            firecracker: None,
        }
    }
}

impl GatewayConfig {
    /// Reads `FAAS_*` variables from the process environment.
    pub fn from_env() -> Result<Self, FaasError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FaasError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("FAAS_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "FAAS_PORT")? {
            config.port = port;
        }
        if let Some(slots) = parse(&lookup, "FAAS_MAX_SANDBOXES")? {
            config.max_concurrent_sandboxes = slots;
        }
        if let Some(bytes) = parse(&lookup, "FAAS_MAX_INPUT_BYTES")? {
            config.max_input_bytes = bytes;
        }
        if let Some(record) = parse(&lookup, "FAAS_RECORD_PROVISIONING_FAILURES")? {
            config.record_provisioning_failures = record;
        }
        if let Some(range) = lookup("FAAS_DEFAULT_TIME_RANGE") {
            config.default_time_range = range
                .parse()
                .map_err(|e| FaasError::Config(format!("FAAS_DEFAULT_TIME_RANGE: {e}")))?;
        }
        if let Some(image) = lookup("FAAS_DOCKER_PYTHON_IMAGE") {
            config.docker.python_image = image;
        }
        if let Some(image) = lookup("FAAS_DOCKER_NODE_IMAGE") {
            config.docker.node_image = image;
        }
        if let Some(bytes) = parse(&lookup, "FAAS_DOCKER_MEMORY_BYTES")? {
            config.docker.memory_limit_bytes = bytes;
        }

        let binary = lookup("FAAS_FIRECRACKER_BIN");
        let kernel = lookup("FAAS_FIRECRACKER_KERNEL");
        let rootfs = lookup("FAAS_FIRECRACKER_ROOTFS");
        if binary.is_some() || kernel.is_some() || rootfs.is_some() {
            let mut firecracker = FirecrackerConfig::default();
            if let Some(binary) = binary {
                firecracker.binary_path = PathBuf::from(binary);
            }
            if let Some(kernel) = kernel {
                firecracker.kernel_image_path = PathBuf::from(kernel);
            }
            if let Some(rootfs) = rootfs {
                firecracker.rootfs_path = PathBuf::from(rootfs);
            }
            if let Some(vcpus) = parse(&lookup, "FAAS_FIRECRACKER_VCPUS")? {
                firecracker.vcpu_count = vcpus;
            }
            if let Some(mem) = parse(&lookup, "FAAS_FIRECRACKER_MEM_MIB")? {
                firecracker.mem_size_mib = mem;
            }
            config.firecracker = Some(firecracker);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FaasError> {
        if self.max_concurrent_sandboxes == 0 {
            return Err(FaasError::Config(
                "max_concurrent_sandboxes must be at least 1".into(),
            ));
        }
        if self.max_input_bytes == 0 {
            return Err(FaasError::Config("max_input_bytes must be positive".into()));
        }
        if self.docker.memory_limit_bytes <= 0 {
            return Err(FaasError::Config(
                "docker memory limit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, FaasError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| FaasError::Config(format!("invalid bind address {}:{}: {e}", self.host, self.port)))
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_input_bytes: self.max_input_bytes,
            record_provisioning_failures: self.record_provisioning_failures,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, FaasError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| FaasError::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

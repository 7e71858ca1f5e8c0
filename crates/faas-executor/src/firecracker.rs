use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use faas_common::guest::{GUEST_CID, GUEST_VSOCK_PORT};
use faas_common::{
    GuestInvocation, GuestReport, ResourceUsage, Sandbox, SandboxError, SandboxOutput,
    SandboxProvider, SandboxSpec, Virtualization,
};
use firecracker_rs_sdk::{
    firecracker::FirecrackerOption,
    instance::Instance as FcInstance,
    models::{vsock::Vsock, BootSource, Drive, MachineConfiguration},
};
use serde::{Deserialize, Serialize};
use tempfile::{Builder as TempFileBuilder, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

// Default paths - These should be overridden via configuration
pub const DEFAULT_FIRECRACKER_BINARY_PATH: &str = "/usr/bin/firecracker";
pub const DEFAULT_KERNEL_IMAGE_PATH: &str = "resources/kernel/vmlinux.bin";
pub const DEFAULT_ROOTFS_PATH: &str = "resources/rootfs/rootfs.ext4";

const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off quiet loglevel=0";
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    pub binary_path: PathBuf,
    pub kernel_image_path: PathBuf,
    /// Base image; every microVM boots from its own copy.
    pub rootfs_path: PathBuf,
    pub vcpu_count: u8,
    pub mem_size_mib: usize,
    pub boot_args: String,
    /// How long the guest agent may take to accept the vsock connection.
    pub boot_timeout: Duration,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: DEFAULT_FIRECRACKER_BINARY_PATH.into(),
            kernel_image_path: DEFAULT_KERNEL_IMAGE_PATH.into(),
            rootfs_path: DEFAULT_ROOTFS_PATH.into(),
            vcpu_count: 1,
            mem_size_mib: 128,
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
            boot_timeout: Duration::from_secs(5),
        }
    }
}

impl FirecrackerConfig {
    /// Checks that every artifact needed to boot a microVM exists.
    pub fn validate(&self) -> Result<(), SandboxError> {
        for (what, path) in [
            ("Firecracker binary", &self.binary_path),
            ("Kernel image", &self.kernel_image_path),
            ("Base rootfs", &self.rootfs_path),
        ] {
            if !path.exists() {
                return Err(SandboxError::Provider(format!(
                    "{what} not found at: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// One throwaway microVM per invocation, reached through the guest agent.
#[derive(Clone)]
pub struct FirecrackerProvider {
    config: FirecrackerConfig,
}

impl FirecrackerProvider {
    pub fn new(config: FirecrackerConfig) -> Self {
        info!(binary = %config.binary_path.display(), kernel = %config.kernel_image_path.display(), "Creating FirecrackerProvider");
        Self { config }
    }

    pub fn config(&self) -> &FirecrackerConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxProvider for FirecrackerProvider {
    fn virtualization(&self) -> Virtualization {
        Virtualization::Firecracker
    }

    #[instrument(skip(self, spec), fields(invocation_id = %spec.invocation_id, function_id = %spec.function_id))]
    async fn acquire(&self, spec: &SandboxSpec) -> Result<Box<dyn Sandbox>, SandboxError> {
        self.config.validate()?;

        let workdir = TempFileBuilder::new()
            .prefix("faas-vm-")
            .tempdir()
            .map_err(|e| SandboxError::Provider(format!("failed to create VM workdir: {e}")))?;
        let paths = VmPaths::in_dir(workdir.path());

        info!(source = %self.config.rootfs_path.display(), dest = %paths.rootfs.display(), "Copying base rootfs for instance");
        tokio::fs::copy(&self.config.rootfs_path, &paths.rootfs)
            .await
            .map_err(|e| SandboxError::Provider(format!("failed to copy rootfs: {e}")))?;
        tokio::fs::File::create(&paths.log)
            .await
            .map_err(|e| SandboxError::Provider(format!("failed to create VM log: {e}")))?;

        let instance = FirecrackerOption::new(&self.config.binary_path)
            .id(&spec.invocation_id)
            .api_sock(&paths.api_sock)
            .log_path(Some(paths.log.clone()))
            .build()
            .map_err(|e| SandboxError::Provider(format!("failed to prepare microVM: {e:?}")))?;

        Ok(Box::new(FirecrackerSandbox {
            id: spec.invocation_id.clone(),
            invocation: GuestInvocation {
                invocation_id: spec.invocation_id.clone(),
                language: spec.language,
                program: spec.program.clone(),
                input: Vec::new(),
            },
            config: self.config.clone(),
            instance: Mutex::new(instance),
            stream: None,
            running: false,
            paths,
            workdir,
        }))
    }

    async fn available(&self) -> bool {
        self.config.validate().is_ok() && Path::new("/dev/kvm").exists()
    }
}

#[derive(Debug, Clone)]
struct VmPaths {
    rootfs: PathBuf,
    api_sock: PathBuf,
    vsock_uds: PathBuf,
    log: PathBuf,
}

impl VmPaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            rootfs: dir.join("rootfs.ext4"),
            api_sock: dir.join("api.sock"),
            vsock_uds: dir.join("vsock.sock"),
            log: dir.join("firecracker.log"),
        }
    }
}

pub struct FirecrackerSandbox {
    id: String,
    invocation: GuestInvocation,
    config: FirecrackerConfig,
    instance: Mutex<FcInstance>,
    stream: Option<UnixStream>,
    running: bool,
    paths: VmPaths,
    workdir: TempDir,
}

impl FirecrackerSandbox {
    async fn boot(&mut self) -> Result<(), firecracker_rs_sdk::Error> {
        let instance = self.instance.get_mut();

        instance.start_vmm().await?;
        wait_for_socket(&self.paths.api_sock).await;

        instance
            .put_machine_configuration(&MachineConfiguration {
                vcpu_count: self.config.vcpu_count as isize,
                mem_size_mib: self.config.mem_size_mib as isize,
                smt: Some(false),
                cpu_template: None,
                track_dirty_pages: None,
                huge_pages: None,
            })
            .await?;

        instance
            .put_guest_boot_source(&BootSource {
                kernel_image_path: self.config.kernel_image_path.clone(),
                boot_args: Some(self.config.boot_args.clone()),
                initrd_path: None,
            })
            .await?;

        instance
            .put_guest_drive_by_id(&Drive {
                drive_id: "rootfs".into(),
                path_on_host: self.paths.rootfs.clone(),
                is_root_device: true,
                is_read_only: false,
                cache_type: None,
                partuuid: None,
                rate_limiter: None,
                io_engine: None,
                socket: None,
            })
            .await?;

        instance
            .put_guest_vsock(&Vsock {
                vsock_id: Some("vsock0".to_string()),
                guest_cid: GUEST_CID as _,
                uds_path: self.paths.vsock_uds.clone(),
            })
            .await?;

        instance.start().await
    }

    async fn stop(&mut self) -> Result<(), SandboxError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        match timeout(STOP_TIMEOUT, self.instance.get_mut().stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SandboxError::Crashed(format!("failed to stop microVM: {e:?}"))),
            Err(_) => Err(SandboxError::Crashed("timeout stopping microVM".into())),
        }
    }
}

#[async_trait]
impl Sandbox for FirecrackerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<(), SandboxError> {
        self.running = true;
        self.boot()
            .await
            .map_err(|e| SandboxError::StartFailed(format!("microVM boot failed: {e:?}")))?;
        info!(instance_id = %self.id, "VM started. Attempting vsock connection...");

        let stream = connect_guest(&self.paths.vsock_uds, GUEST_VSOCK_PORT, self.config.boot_timeout)
            .await
            .map_err(|e| SandboxError::StartFailed(format!("guest agent unreachable: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn run(&mut self, input: &[u8]) -> Result<SandboxOutput, SandboxError> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| SandboxError::StartFailed("microVM was not started".into()))?;
        let (mut reader, mut writer) = stream.into_split();

        let mut invocation = self.invocation.clone();
        invocation.input = input.to_vec();
        let request = serde_json::to_vec(&invocation)
            .map_err(|e| SandboxError::Crashed(format!("invocation serialization failed: {e}")))?;
        writer.write_all(&request).await?;
        writer.shutdown().await?;

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        let report: GuestReport = serde_json::from_slice(&buffer)
            .map_err(|e| SandboxError::Crashed(format!("malformed guest report: {e}")))?;
        if report.invocation_id != self.id {
            return Err(SandboxError::Crashed(format!(
                "guest answered for invocation {}",
                report.invocation_id
            )));
        }
        debug!(instance_id = %self.id, exit_code = ?report.exit_code, "Received guest report");
        Ok(report.into())
    }

    async fn terminate(&mut self) -> Result<(), SandboxError> {
        self.stream = None;
        self.stop().await
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, SandboxError> {
        // the host has no per-guest accounting; the in-guest report is authoritative
        Ok(ResourceUsage::unmeasured())
    }

    async fn release(mut self: Box<Self>) -> Result<(), SandboxError> {
        info!(instance_id = %self.id, "Cleaning up Firecracker resources");
        let stopped = self.stop().await;
        let FirecrackerSandbox { workdir, .. } = *self;
        let removed = tokio::task::spawn_blocking(move || workdir.close())
            .await
            .map_err(|e| SandboxError::Provider(format!("cleanup task failed: {e}")))?;
        removed?;
        stopped
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..30 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    warn!(path = %path.display(), "API socket did not appear, configuring anyway");
}

/// Opens a host-initiated vsock connection through Firecracker's UDS proxy,
/// retrying until the guest agent listens or `deadline` passes.
async fn connect_guest(uds_path: &Path, port: u32, deadline: Duration) -> std::io::Result<UnixStream> {
    timeout(deadline, async {
        loop {
            match try_connect(uds_path, port).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!(error = %e, path = %uds_path.display(), "Vsock connect attempt failed, retrying");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    })
    .await
    .map_err(|_| {
        warn!(timeout = ?deadline, path = %uds_path.display(), "Timeout connecting to vsock UDS");
        std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout connecting to guest vsock")
    })
}

async fn try_connect(uds_path: &Path, port: u32) -> std::io::Result<UnixStream> {
    let mut stream = UnixStream::connect(uds_path).await?;
    stream.write_all(format!("CONNECT {port}\n").as_bytes()).await?;

    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 32 {
            break;
        }
    }
    if line.starts_with(b"OK ") {
        Ok(stream)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("vsock handshake rejected: {}", String::from_utf8_lossy(&line)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_missing_artifacts_are_provisioning_errors() {
        let config = FirecrackerConfig {
            binary_path: "/nonexistent/firecracker".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_provisioning());
        assert!(err.to_string().contains("Firecracker binary"));
    }

    #[tokio::test]
    async fn test_acquire_fails_without_artifacts() {
        let provider = FirecrackerProvider::new(FirecrackerConfig {
            kernel_image_path: "/nonexistent/vmlinux".into(),
            ..Default::default()
        });
        let spec = SandboxSpec {
            invocation_id: "i".into(),
            function_id: "f".into(),
            language: faas_common::Language::Python,
            program: String::new(),
            timeout: Duration::from_secs(1),
        };
        let err = provider.acquire(&spec).await.err().unwrap();
        assert!(err.is_provisioning());
        assert!(!provider.available().await);
    }

    #[tokio::test]
    async fn test_vsock_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let uds = dir.path().join("v.sock");
        let listener = UnixListener::bind(&uds).unwrap();

        let proxy = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 13];
            conn.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"CONNECT 1234\n");
            conn.write_all(b"OK 1073741824\n").await.unwrap();
            conn.write_all(b"payload").await.unwrap();
        });

        let mut stream = connect_guest(&uds, GUEST_VSOCK_PORT, Duration::from_secs(2))
            .await
            .unwrap();
        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "payload");
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_vsock_connect_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_guest(&dir.path().join("missing.sock"), 1234, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}

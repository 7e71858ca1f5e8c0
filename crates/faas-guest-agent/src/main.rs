use faas_common::guest::{GUEST_CID, GUEST_VSOCK_PORT};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(target_os = "linux")]
async fn serve() -> Result<(), faas_guest_agent::AgentError> {
    use faas_guest_agent::{handle_connection, AgentError};
    use std::net::Shutdown;
    use tokio::time::Duration;
    use tokio_vsock::VsockListener;

    let mut listener =
        VsockListener::bind(GUEST_CID, GUEST_VSOCK_PORT).map_err(AgentError::VsockBind)?;
    info!(cid = GUEST_CID, port = GUEST_VSOCK_PORT, "Listening on vsock");

    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                info!(peer_addr = ?addr, "Accepted vsock connection");
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(&mut stream).await {
                        error!(error = %e, "Error handling connection");
                    }
                    let _ = stream.shutdown(Shutdown::Both);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept vsock connection");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn serve() -> Result<(), faas_guest_agent::AgentError> {
    Err(faas_guest_agent::AgentError::VsockBind(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "vsock is only available on Linux guests",
    )))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!(cid = GUEST_CID, port = GUEST_VSOCK_PORT, "Starting FaaS Guest Agent on Vsock...");

    if let Err(e) = serve().await {
        error!(error = %e, "Guest agent stopped");
        std::process::exit(1);
    }
}

use std::sync::Arc;

use anyhow::Context;
use faas_common::SandboxProvider;
use faas_executor::{DockerProvider, FirecrackerProvider, ProviderRegistry};
use faas_gateway_server::{create_app, AppState, GatewayConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,faas_gateway_server=debug,faas_executor=debug")
            }),
        )
        .init();

    let config = GatewayConfig::from_env().context("failed to load gateway configuration")?;
    let addr = config.socket_addr()?;

    let mut registry = ProviderRegistry::new(config.max_concurrent_sandboxes);

    let docker = DockerProvider::connect_local(config.docker.clone())
        .context("failed to create Docker client")?;
    if docker.available().await {
        info!("Docker provider ready");
    } else {
        warn!("Docker daemon is not reachable, docker executions will fail until it is");
    }
    registry.register(Arc::new(docker));

    match &config.firecracker {
        Some(fc_config) => {
            let provider = FirecrackerProvider::new(fc_config.clone());
            match fc_config.validate() {
                Ok(()) => info!("Firecracker provider ready"),
                Err(e) => warn!(error = %e, "Firecracker provider registered but not bootable"),
            }
            registry.register(Arc::new(provider));
        }
        None => info!("No Firecracker configuration, microVM executions are disabled"),
    }

    let state = AppState::from_config(&config, registry);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, capacity = config.max_concurrent_sandboxes, "FaaS gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("FaaS gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

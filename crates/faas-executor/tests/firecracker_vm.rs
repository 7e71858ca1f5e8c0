//! Boots real microVMs. Needs KVM, the firecracker binary, and a guest image
//! with the agent installed, so it only builds with `--features firecracker-tests`.
#![cfg(all(feature = "firecracker-tests", target_os = "linux"))]

use std::path::PathBuf;
use std::sync::Arc;

use faas_common::{ExecutionRequest, Function, Language, OutcomeKind, Virtualization};
use faas_executor::{
    require_firecracker, FirecrackerConfig, FirecrackerProvider, InvocationRunner,
    ProviderRegistry,
};
use faas_metrics::MetricsAggregator;
use serde_json::json;
use serial_test::serial;

fn config() -> FirecrackerConfig {
    let mut config = FirecrackerConfig::default();
    if let Ok(kernel) = std::env::var("FAAS_FIRECRACKER_KERNEL") {
        config.kernel_image_path = PathBuf::from(kernel);
    }
    if let Ok(rootfs) = std::env::var("FAAS_FIRECRACKER_ROOTFS") {
        config.rootfs_path = PathBuf::from(rootfs);
    }
    config
}

fn runner() -> InvocationRunner {
    let registry =
        ProviderRegistry::new(2).with_provider(Arc::new(FirecrackerProvider::new(config())));
    InvocationRunner::new(Arc::new(registry), MetricsAggregator::default())
}

#[tokio::test]
#[serial]
async fn test_python_square_in_microvm() {
    require_firecracker!();

    let f = Function::new(
        "square",
        Language::Python,
        "def main(input):\n    return {'squared': input['number'] ** 2}",
        10_000,
        Virtualization::Firecracker,
    );
    let result = runner()
        .execute(&f, &ExecutionRequest::new(&f.id, json!({"number": 5})))
        .await
        .unwrap();

    assert!(result.success(), "{result}");
    assert_eq!(result.result(), Some(&json!({"squared": 25})));
    assert!(result.usage.peak_memory_bytes.is_some());
}

#[tokio::test]
#[serial]
async fn test_microvm_timeout_is_enforced() {
    require_firecracker!();

    let f = Function::new(
        "spin",
        Language::Python,
        "def main(input):\n    while True:\n        pass",
        2_000,
        Virtualization::Firecracker,
    );
    let result = runner()
        .execute(&f, &ExecutionRequest::new(&f.id, json!({})))
        .await
        .unwrap();

    assert_eq!(result.kind(), OutcomeKind::Timeout);
    assert_eq!(result.error(), Some("execution timed out after 2000ms"));
}

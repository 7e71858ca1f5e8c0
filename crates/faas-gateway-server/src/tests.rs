use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use faas_common::{ResourceUsage, Virtualization};
use faas_executor::test_utils::{Behavior, ScriptedProvider};
use faas_executor::{InvocationRunner, ProviderRegistry};
use faas_metrics::MetricsAggregator;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{create_app, AppState, InMemoryFunctionStore};

fn square(input: Value) -> Result<Value, String> {
    let n = input["number"]
        .as_i64()
        .ok_or_else(|| "TypeError: number is required".to_string())?;
    Ok(json!({ "squared": n * n }))
}

fn echo(input: Value) -> Result<Value, String> {
    Ok(input)
}

fn create_test_app(providers: Vec<ScriptedProvider>) -> Router {
    let mut registry = ProviderRegistry::new(4);
    for provider in providers {
        registry.register(Arc::new(provider));
    }
    let runner = InvocationRunner::new(Arc::new(registry), MetricsAggregator::default());
    create_app(AppState::new(Arc::new(InMemoryFunctionStore::new()), runner))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn deploy(app: &Router, name: &str, extra: Value) -> String {
    let mut body = json!({
        "name": name,
        "language": "python",
        "code": "def main(input):\n    return {'squared': input['number'] ** 2}",
    });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    let (status, function) = send(app, "POST", "/api/functions", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{function}");
    function["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Hang)]);
    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
    assert_eq!(json["providers"]["docker"], true);
    assert_eq!(json["providers"]["firecracker"], false);
    assert_eq!(json["capacity"], json!({"total": 4, "available": 4}));
}

#[tokio::test]
async fn test_health_degraded_without_ready_providers() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Hang).unavailable()]);
    let (_, json) = send(&app, "GET", "/health", None).await;
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn test_function_crud() {
    let app = create_test_app(vec![]);
    let id = deploy(&app, "square", json!({})).await;

    let (status, function) = send(&app, "GET", &format!("/api/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(function["timeout"], 30000);
    assert_eq!(function["virtualization"], "docker");
    assert!(function["createdAt"].is_string());

    let (status, err) = send(
        &app,
        "POST",
        "/api/functions",
        Some(json!({"name": "square", "language": "python", "code": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("already exists"));

    let (status, updated) = send(
        &app,
        "PUT",
        &format!("/api/functions/{id}"),
        Some(json!({"virtualization": "firecracker", "timeout": 5000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["virtualization"], "firecracker");
    assert_eq!(updated["timeout"], 5000);
    assert_eq!(updated["name"], "square");

    let (status, list) = send(&app, "GET", "/api/functions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "DELETE", &format!("/api/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Function deleted successfully");

    let (status, body) = send(&app, "GET", &format!("/api/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Function not found");

    let (status, _) = send(&app, "DELETE", &format!("/api/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected() {
    let app = create_test_app(vec![]);

    let (status, body) = send(
        &app,
        "POST",
        "/api/functions",
        Some(json!({"name": "f", "language": "python", "code": "x", "timeout": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(
        &app,
        "POST",
        "/api/functions",
        Some(json!({"name": "f", "language": "cobol", "code": "x"})),
    )
    .await;
    assert!(status.is_client_error());
    assert!(body["error"].is_string());

    let (status, _) = send(
        &app,
        "PUT",
        "/api/functions/missing",
        Some(json!({"timeout": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_square() {
    let provider = ScriptedProvider::docker(Behavior::Compute(square))
        .with_reported_usage(ResourceUsage::measured(0.02, 12_000_000));
    let app = create_test_app(vec![provider]);
    let id = deploy(&app, "square", json!({})).await;

    let (status, envelope) = send(
        &app,
        "POST",
        &format!("/api/executions/{id}"),
        Some(json!({"input": {"number": 5}})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["result"], json!({"squared": 25}));
    assert!(envelope.get("error").is_none());
    assert!(envelope["executionTime"].is_u64());
    assert_eq!(envelope["metrics"]["memory"], 12_000_000);
    assert_eq!(envelope["metrics"]["cpu"], 0.02);
}

#[tokio::test]
async fn test_execute_without_body_uses_empty_input() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Compute(echo))]);
    let id = deploy(&app, "echo", json!({})).await;

    let (status, envelope) = send(&app, "POST", &format!("/api/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["result"], json!({}));
    assert!(envelope["metrics"]["memory"].is_null());
}

#[tokio::test]
async fn test_execute_unknown_function() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Compute(echo))]);
    let (status, body) = send(&app, "POST", "/api/executions/nope", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Function not found"}));
}

#[tokio::test]
async fn test_user_error_is_an_envelope() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Compute(square))]);
    let id = deploy(&app, "square", json!({})).await;

    let (status, envelope) = send(
        &app,
        "POST",
        &format!("/api/executions/{id}"),
        Some(json!({"input": {"number": "five"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["success"], false);
    assert!(envelope.get("result").is_none());
    assert!(envelope["error"].as_str().unwrap().contains("TypeError"));
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Hang)]);
    let id = deploy(&app, "sleepy", json!({"timeout": 1000})).await;

    let (status, envelope) = send(&app, "POST", &format!("/api/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["error"], "execution timed out after 1000ms");
    assert!(envelope["executionTime"].as_u64().unwrap() >= 1000);
}

#[tokio::test]
async fn test_provisioning_failure_is_service_unavailable() {
    let app = create_test_app(vec![ScriptedProvider::failing(
        Virtualization::Docker,
        "daemon unreachable",
    )]);
    let id = deploy(&app, "square", json!({})).await;

    let (status, body) = send(&app, "POST", &format!("/api/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("daemon unreachable"));

    let (_, history) = send(&app, "GET", &format!("/api/executions/{id}/history"), None).await;
    assert_eq!(history, json!([]));
}

#[tokio::test]
async fn test_malformed_execution_body() {
    let app = create_test_app(vec![ScriptedProvider::docker(Behavior::Compute(echo))]);
    let id = deploy(&app, "echo", json!({})).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/executions/{id}"))
                .body(Body::from("{\"input\": "))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_and_history() {
    let app = create_test_app(vec![
        ScriptedProvider::docker(Behavior::Compute(square)),
        ScriptedProvider::firecracker(Behavior::Compute(square)),
    ]);
    let id = deploy(&app, "square", json!({})).await;
    let uri = format!("/api/executions/{id}");

    send(&app, "POST", &uri, Some(json!({"input": {"number": 3}}))).await;
    send(&app, "POST", &uri, Some(json!({"input": {}}))).await;
    send(
        &app,
        "PUT",
        &format!("/api/functions/{id}"),
        Some(json!({"virtualization": "firecracker"})),
    )
    .await;
    send(&app, "POST", &uri, Some(json!({"input": {"number": 4}}))).await;

    let (status, system) = send(&app, "GET", "/api/metrics/system?timeRange=1h", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(system["totalExecutions"], 3);
    assert_eq!(system["successfulExecutions"], 2);
    assert_eq!(system["failedExecutions"], 1);
    assert_eq!(system["executionsByVirtualization"]["docker"], 2);
    assert_eq!(system["executionsByVirtualization"]["firecracker"], 1);

    let (status, metrics) = send(&app, "GET", &format!("/api/metrics/functions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["aggregates"]["totalExecutions"], 3);
    let series = metrics["metrics"].as_array().unwrap();
    assert_eq!(series.len(), 3);

    let (status, history) = send(
        &app,
        "GET",
        &format!("/api/executions/{id}/history?timeRange=24h"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0]["virtualization"], "firecracker");
    assert_eq!(history[0]["success"], true);

    let (status, body) = send(&app, "GET", "/api/metrics/system?timeRange=3w", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, "GET", "/api/executions/unknown/history", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unparseable_query_is_a_json_error() {
    let app = create_test_app(vec![]);
    let id = deploy(&app, "square", json!({})).await;

    for uri in [
        "/api/metrics/system?timeRange=1h&timeRange=2h".to_string(),
        format!("/api/metrics/functions/{id}?timeRange=1h&timeRange=2h"),
        format!("/api/executions/{id}/history?timeRange=1h&timeRange=2h"),
    ] {
        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}: {body}");
    }
}

#[tokio::test]
async fn test_oversized_time_range_is_accepted() {
    let app = create_test_app(vec![]);
    let (status, system) = send(&app, "GET", "/api/metrics/system?timeRange=99999999d", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(system["totalExecutions"], 0);
}

#[tokio::test]
async fn test_metrics_on_empty_log() {
    let app = create_test_app(vec![]);
    let (status, system) = send(&app, "GET", "/api/metrics/system", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(system["totalExecutions"], 0);
    assert_eq!(system["successRate"], 0.0);
    assert!(system["averageMemoryUsage"].is_null());
}

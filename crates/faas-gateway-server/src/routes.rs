use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use faas_common::{ExecutionRequest, Function, Value};
use faas_executor::serializer::ResponseEnvelope;
use faas_metrics::{ExecutionRecord, FunctionMetrics, MetricsAggregate, TimeRange};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::functions::{FunctionUpdate, NewFunction};
use crate::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// `?timeRange=` on every metrics route. Absent or empty falls back to the
/// configured default.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
}

impl RangeQuery {
    fn resolve(&self, default: TimeRange) -> ApiResult<TimeRange> {
        match self.time_range.as_deref().map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => Ok(raw.parse::<TimeRange>()?),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    input: Option<Value>,
}

/// A missing body, a missing `input` or a `null` input all mean `{}`.
fn parse_input(body: &[u8]) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let body: ExecuteBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
    Ok(match body.input {
        None | Some(Value::Null) => json!({}),
        Some(input) => input,
    })
}

async fn find_function(state: &AppState, id: &str) -> ApiResult<Function> {
    state
        .functions
        .get(id)
        .await?
        .ok_or_else(ApiError::function_not_found)
}

pub async fn list_functions(State(state): State<AppState>) -> ApiResult<Json<Vec<Function>>> {
    Ok(Json(state.functions.list().await?))
}

pub async fn get_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Function>> {
    Ok(Json(find_function(&state, &id).await?))
}

pub async fn create_function(
    State(state): State<AppState>,
    payload: Result<Json<NewFunction>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Function>)> {
    let Json(new) = payload?;
    let function = state.functions.create(new).await?;
    Ok((StatusCode::CREATED, Json(function)))
}

pub async fn update_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<FunctionUpdate>, JsonRejection>,
) -> ApiResult<Json<Function>> {
    let Json(update) = payload?;
    match state.functions.update(&id, update).await {
        Ok(function) => Ok(Json(function)),
        Err(faas_common::FaasError::NotFound(_)) => Err(ApiError::function_not_found()),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_function(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.functions.delete(&id).await? {
        return Err(ApiError::function_not_found());
    }
    Ok(Json(json!({ "message": "Function deleted successfully" })))
}

pub async fn execute_function(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ResponseEnvelope>> {
    let function = find_function(&state, &function_id).await?;
    let input = parse_input(&body)?;

    info!(%function_id, virtualization = %function.virtualization, "Executing function");
    let result = state
        .runner
        .execute(&function, &ExecutionRequest::new(&function.id, input))
        .await?;

    if let Some(error) = result.error() {
        warn!(%function_id, kind = ?result.kind(), %error, "Function execution failed");
    }
    Ok(Json(ResponseEnvelope::from(&result)))
}

pub async fn execution_history(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<ExecutionRecord>>> {
    let Query(query) = query?;
    let range = query.resolve(state.default_time_range)?;
    find_function(&state, &function_id).await?;
    Ok(Json(state.runner.metrics().history(&function_id, range).await?))
}

pub async fn system_metrics(
    State(state): State<AppState>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<Json<MetricsAggregate>> {
    let Query(query) = query?;
    let range = query.resolve(state.default_time_range)?;
    Ok(Json(state.runner.metrics().query_system(range).await?))
}

pub async fn function_metrics(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<Json<FunctionMetrics>> {
    let Query(query) = query?;
    let range = query.resolve(state.default_time_range)?;
    Ok(Json(
        state
            .runner
            .metrics()
            .query_function(&function_id, range)
            .await?,
    ))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let registry = state.runner.registry();
    let providers = registry.availability().await;
    let status = if providers.values().any(|ready| *ready) {
        "healthy"
    } else {
        "degraded"
    };
    let providers: serde_json::Map<String, Value> = providers
        .into_iter()
        .map(|(virtualization, ready)| (virtualization.to_string(), Value::Bool(ready)))
        .collect();

    Json(json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "providers": providers,
        "capacity": {
            "total": registry.capacity(),
            "available": registry.available_slots(),
        },
    }))
}

//! HTTP surface of the FaaS platform: function definitions, executions,
//! metrics and health, all mounted under `/api` except `/health`.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use faas_executor::{InvocationRunner, ProviderRegistry};
use faas_metrics::{MetricsAggregator, TimeRange};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod functions;
pub mod routes;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use functions::{FunctionStore, FunctionUpdate, InMemoryFunctionStore, NewFunction};

/// Room for the `{"input": ...}` wrapper around the largest accepted input.
const BODY_SLACK_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub functions: Arc<dyn FunctionStore>,
    pub runner: InvocationRunner,
    pub default_time_range: TimeRange,
    pub body_limit: usize,
}

impl AppState {
    pub fn new(functions: Arc<dyn FunctionStore>, runner: InvocationRunner) -> Self {
        Self {
            functions,
            runner,
            default_time_range: TimeRange::default(),
            body_limit: faas_executor::runner::DEFAULT_MAX_INPUT_BYTES + BODY_SLACK_BYTES,
        }
    }

    /// Wires an in-memory function store and a fresh metrics log to `registry`.
    pub fn from_config(config: &GatewayConfig, registry: ProviderRegistry) -> Self {
        let runner = InvocationRunner::new(Arc::new(registry), MetricsAggregator::default())
            .with_config(config.runner_config());
        Self {
            functions: Arc::new(InMemoryFunctionStore::new()),
            runner,
            default_time_range: config.default_time_range,
            body_limit: config.max_input_bytes.saturating_add(BODY_SLACK_BYTES),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/functions",
            get(routes::list_functions).post(routes::create_function),
        )
        .route(
            "/functions/:id",
            get(routes::get_function)
                .put(routes::update_function)
                .delete(routes::delete_function),
        )
        .route("/executions/:function_id", post(routes::execute_function))
        .route(
            "/executions/:function_id/history",
            get(routes::execution_history),
        )
        .route("/metrics/system", get(routes::system_metrics))
        .route("/metrics/functions/:function_id", get(routes::function_metrics));

    let body_limit = state.body_limit;
    Router::new()
        .nest("/api", api)
        .route("/health", get(routes::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests;

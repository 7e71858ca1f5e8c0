//! # FaaS Platform Rust SDK
//!
//! Typed client for the gateway's HTTP surface: function definitions,
//! executions, execution history, metrics and health.
//!
//! ```rust,no_run
//! use faas_sdk::{ClientConfig, CreateFunction, FaasClient};
//! use faas_common::Language;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), faas_sdk::SdkError> {
//! let client = FaasClient::new(ClientConfig::from_env()?)?;
//!
//! let function = client
//!     .create_function(&CreateFunction::new(
//!         "square",
//!         Language::Python,
//!         "def main(input):\n    return {'squared': input['number'] ** 2}",
//!     ))
//!     .await?;
//!
//! let response = client.execute(&function.id, json!({ "number": 5 })).await?;
//! assert_eq!(response.result, Some(json!({ "squared": 25 })));
//! # Ok(())
//! # }
//! ```
//!
//! Failed invocations (user errors, timeouts, start failures) are not Rust
//! errors: they come back as an [`ExecutionResponse`] with `success: false`.
//! Only transport problems and non-2xx statuses become [`SdkError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use faas_common::{Function, Language, Value, Virtualization};
use faas_metrics::{ExecutionRecord, FunctionMetrics, MetricsAggregate, TimeRange};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl SdkError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;

/// Where the gateway lives and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root including the `/api` prefix, e.g. `http://localhost:3000/api`.
    pub base_url: String,
    /// Covers the whole request, including the function's run time.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reads `FAAS_BASE_URL` and `FAAS_REQUEST_TIMEOUT_MS`, falling back to
    /// the defaults for whichever is unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("FAAS_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(raw) = std::env::var("FAAS_REQUEST_TIMEOUT_MS") {
            let millis: u64 = raw.trim().parse().map_err(|e| {
                SdkError::InvalidConfig(format!("FAAS_REQUEST_TIMEOUT_MS={raw:?}: {e}"))
            })?;
            config.request_timeout = Duration::from_millis(millis);
        }
        Ok(config)
    }

    fn api_root(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SdkError::InvalidConfig(format!("base_url {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SdkError::InvalidConfig(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        // joining relative paths needs a trailing slash on the root
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

/// Body of a function creation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunction {
    pub name: String,
    pub language: Language,
    pub code: String,
    /// Milliseconds; the server defaults to 30000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// The server defaults to docker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualization: Option<Virtualization>,
}

impl CreateFunction {
    pub fn new(name: impl Into<String>, language: Language, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language,
            code: code.into(),
            timeout: None,
            virtualization: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn with_virtualization(mut self, virtualization: Virtualization) -> Self {
        self.virtualization = Some(virtualization);
        self
    }
}

/// Partial update; only the fields that are set are sent.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualization: Option<Virtualization>,
}

/// The execution envelope returned by `POST /executions/{id}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Milliseconds.
    pub execution_time: u64,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ExecutionMetrics {
    /// Peak bytes, `None` when unmeasured.
    pub memory: Option<u64>,
    /// CPU seconds, `None` when unmeasured.
    pub cpu: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub providers: std::collections::BTreeMap<String, bool>,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Capacity {
    pub total: usize,
    pub available: usize,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    input: &'a Value,
}

/// Client for one gateway. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct FaasClient {
    client: Client,
    root: Url,
}

impl FaasClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let root = config.api_root()?;
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, root })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.root
            .join(path)
            .map_err(|e| SdkError::InvalidConfig(format!("cannot build URL for {path}: {e}")))
    }

    /// Runs a deployed function once with `input`.
    pub async fn execute(&self, function_id: &str, input: Value) -> Result<ExecutionResponse> {
        let url = self.url(&format!("executions/{function_id}"))?;
        debug!(%url, "Executing function");
        let response = self
            .client
            .post(url)
            .json(&ExecuteBody { input: &input })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn list_functions(&self) -> Result<Vec<Function>> {
        let response = self.client.get(self.url("functions")?).send().await?;
        decode(response).await
    }

    pub async fn get_function(&self, id: &str) -> Result<Function> {
        let response = self
            .client
            .get(self.url(&format!("functions/{id}"))?)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn create_function(&self, function: &CreateFunction) -> Result<Function> {
        let response = self
            .client
            .post(self.url("functions")?)
            .json(function)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn update_function(&self, id: &str, update: &UpdateFunction) -> Result<Function> {
        let response = self
            .client
            .put(self.url(&format!("functions/{id}"))?)
            .json(update)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn delete_function(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("functions/{id}"))?)
            .send()
            .await?;
        let _: Value = decode(response).await?;
        Ok(())
    }

    pub async fn system_metrics(&self, range: TimeRange) -> Result<MetricsAggregate> {
        let response = self
            .client
            .get(self.url("metrics/system")?)
            .query(&[("timeRange", range.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn function_metrics(&self, id: &str, range: TimeRange) -> Result<FunctionMetrics> {
        let response = self
            .client
            .get(self.url(&format!("metrics/functions/{id}"))?)
            .query(&[("timeRange", range.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    /// Execution records of one function, newest first.
    pub async fn history(&self, id: &str, range: TimeRange) -> Result<Vec<ExecutionRecord>> {
        let response = self
            .client
            .get(self.url(&format!("executions/{id}/history"))?)
            .query(&[("timeRange", range.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    /// `GET /health`, which lives beside the API root rather than under it.
    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self.client.get(self.url("../health")?).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        return Err(api_error(status, &bytes));
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn api_error(status: StatusCode, body: &[u8]) -> SdkError {
    let message = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(body) => body.error,
        Err(_) if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    };
    SdkError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_api_root_gets_trailing_slash() {
        let client = FaasClient::new(ClientConfig::new("http://localhost:3000/api")).unwrap();
        assert_eq!(
            client.url("functions").unwrap().as_str(),
            "http://localhost:3000/api/functions"
        );
        assert_eq!(
            client.url("../health").unwrap().as_str(),
            "http://localhost:3000/health"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = FaasClient::new(ClientConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, SdkError::InvalidConfig(_)));

        let err = FaasClient::new(ClientConfig::new("ftp://example.com/api")).unwrap_err();
        assert!(matches!(err, SdkError::InvalidConfig(_)));
    }

    #[test]
    fn test_api_error_message_extraction() {
        let err = api_error(StatusCode::NOT_FOUND, br#"{"error":"Function not found"}"#);
        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("Function not found"));

        let err = api_error(StatusCode::BAD_GATEWAY, b"");
        assert!(err.to_string().contains("Bad Gateway"));

        let err = api_error(StatusCode::INTERNAL_SERVER_ERROR, b"plain text");
        assert!(err.to_string().contains("plain text"));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::remove_var("FAAS_BASE_URL");
        std::env::remove_var("FAAS_REQUEST_TIMEOUT_MS");
        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);

        std::env::set_var("FAAS_BASE_URL", "http://gateway:8080/api");
        std::env::set_var("FAAS_REQUEST_TIMEOUT_MS", "1500");
        let config = ClientConfig::from_env();
        std::env::set_var("FAAS_REQUEST_TIMEOUT_MS", "soon");
        let invalid = ClientConfig::from_env();
        std::env::remove_var("FAAS_BASE_URL");
        std::env::remove_var("FAAS_REQUEST_TIMEOUT_MS");

        let config = config.unwrap();
        assert_eq!(config.base_url, "http://gateway:8080/api");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert!(matches!(invalid, Err(SdkError::InvalidConfig(_))));
    }
}

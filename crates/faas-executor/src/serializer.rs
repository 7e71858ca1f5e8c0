use faas_common::{ExecutionResult, InvocationOutcome};
use serde::Serialize;
use serde_json::Value;

/// Client-facing form of an [`ExecutionResult`].
///
/// `result` is present exactly when `success` is true (it may be `null`),
/// `error` exactly when it is false. `metrics` is always present; a field
/// that was not measured is `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds.
    pub execution_time: u64,
    pub metrics: EnvelopeMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvelopeMetrics {
    /// Peak bytes.
    pub memory: Option<u64>,
    /// Seconds.
    pub cpu: Option<f64>,
}

impl From<&ExecutionResult> for ResponseEnvelope {
    fn from(result: &ExecutionResult) -> Self {
        let (success, value, error) = match &result.outcome {
            InvocationOutcome::Returned(value) => (true, Some(value.clone()), None),
            InvocationOutcome::Failed { message, .. } => (false, None, Some(message.clone())),
        };
        Self {
            success,
            result: value,
            error,
            execution_time: result.execution_time_ms(),
            metrics: EnvelopeMetrics {
                memory: result.usage.peak_memory_bytes,
                cpu: result.usage.cpu_seconds,
            },
        }
    }
}

impl ResponseEnvelope {
    pub fn to_value(&self) -> Value {
        // Infallible: every field is a plain JSON type and map keys are strings.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Serializes `result` to its wire form. The same result always produces
/// the same bytes.
pub fn serialize(result: &ExecutionResult) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&ResponseEnvelope::from(result))
}

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use faas_common::{ExecutionResult, OutcomeKind, Virtualization};
use serde::{Deserialize, Serialize};

use crate::MetricsError;

/// One completed invocation attempt. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub function_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub outcome: OutcomeKind,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub memory_usage: Option<u64>,
    pub cpu_usage: Option<f64>,
    /// Technology used for this attempt, not the function's current setting.
    pub virtualization: Virtualization,
}

impl ExecutionRecord {
    pub fn from_result(
        execution_id: impl Into<String>,
        function_id: impl Into<String>,
        virtualization: Virtualization,
        started_at: DateTime<Utc>,
        result: &ExecutionResult,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            function_id: function_id.into(),
            timestamp: started_at,
            success: result.success(),
            outcome: result.kind(),
            execution_time_ms: result.execution_time_ms(),
            error: result.error().map(str::to_owned),
            memory_usage: result.usage.peak_memory_bytes,
            cpu_usage: result.usage.cpu_seconds,
            virtualization,
        }
    }

    /// Record for an attempt that never got a sandbox.
    pub fn provisioning_failure(
        execution_id: impl Into<String>,
        function_id: impl Into<String>,
        virtualization: Virtualization,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            function_id: function_id.into(),
            timestamp: started_at,
            success: false,
            outcome: OutcomeKind::ProvisioningFailed,
            execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error: Some(message.into()),
            memory_usage: None,
            cpu_usage: None,
            virtualization,
        }
    }
}

/// Length of an aggregate window, e.g. `1h`, `24h`, `7d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    amount: u32,
    unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Minutes,
    Hours,
    Days,
}

impl TimeRange {
    pub fn minutes(amount: u32) -> Self {
        Self {
            amount,
            unit: TimeUnit::Minutes,
        }
    }

    pub fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: TimeUnit::Hours,
        }
    }

    pub fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: TimeUnit::Days,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        let amount = i64::from(self.amount);
        match self.unit {
            TimeUnit::Minutes => chrono::Duration::minutes(amount),
            TimeUnit::Hours => chrono::Duration::hours(amount),
            TimeUnit::Days => chrono::Duration::days(amount),
        }
    }

    /// `[now - range, now]`, starting at the earliest representable instant
    /// when the range reaches further back than that.
    pub fn window_ending(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow {
            start: now
                .checked_sub_signed(self.duration())
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: now,
        }
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::hours(24)
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suffix = match self.unit {
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
        };
        write!(f, "{}{}", self.amount, suffix)
    }
}

impl FromStr for TimeRange {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MetricsError::InvalidTimeRange(s.to_string());
        let s = s.trim();
        let split = s.len().checked_sub(1).ok_or_else(invalid)?;
        if !s.is_char_boundary(split) {
            return Err(invalid());
        }
        let (digits, unit) = s.split_at(split);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }
        let unit = match unit {
            "m" => TimeUnit::Minutes,
            "h" => TimeUnit::Hours,
            "d" => TimeUnit::Days,
            _ => return Err(invalid()),
        };
        Ok(Self { amount, unit })
    }
}

impl Serialize for TimeRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Closed interval of record timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Summary of the records in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAggregate {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Percentage in `[0, 100]`; 0 when the window is empty.
    pub success_rate: f64,
    /// Milliseconds; 0 when the window is empty.
    pub average_execution_time: f64,
    /// Bytes, over measured records only; `None` when nothing was measured.
    pub average_memory_usage: Option<f64>,
    /// Seconds, over measured records only; `None` when nothing was measured.
    pub average_cpu_usage: Option<f64>,
    pub executions_by_virtualization: BTreeMap<String, u64>,
}

impl MetricsAggregate {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ExecutionRecord>,
    {
        let mut by_virtualization: BTreeMap<String, u64> = Virtualization::ALL
            .iter()
            .map(|v| (v.as_str().to_string(), 0))
            .collect();

        let mut total = 0u64;
        let mut successful = 0u64;
        let mut time_sum = 0f64;
        let mut memory = Mean::default();
        let mut cpu = Mean::default();

        for record in records {
            total += 1;
            if record.success {
                successful += 1;
            }
            time_sum += record.execution_time_ms as f64;
            if let Some(bytes) = record.memory_usage {
                memory.push(bytes as f64);
            }
            if let Some(seconds) = record.cpu_usage {
                cpu.push(seconds);
            }
            *by_virtualization
                .entry(record.virtualization.as_str().to_string())
                .or_insert(0) += 1;
        }

        let (success_rate, average_execution_time) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                successful as f64 / total as f64 * 100.0,
                time_sum / total as f64,
            )
        };

        Self {
            total_executions: total,
            successful_executions: successful,
            failed_executions: total - successful,
            success_rate,
            average_execution_time,
            average_memory_usage: memory.value(),
            average_cpu_usage: cpu.value(),
            executions_by_virtualization: by_virtualization,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_executions == 0
    }
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// One plotted point of a function's series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub execution_time: u64,
    pub memory: Option<u64>,
    pub cpu: Option<f64>,
    pub success: bool,
}

impl From<&ExecutionRecord> for SeriesPoint {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            execution_time: record.execution_time_ms,
            memory: record.memory_usage,
            cpu: record.cpu_usage,
            success: record.success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMetrics {
    pub aggregates: MetricsAggregate,
    /// Ordered by timestamp, oldest first.
    pub metrics: Vec<SeriesPoint>,
}

use crate::{
    ExecutionRecord, FunctionMetrics, InMemoryStorage, MetricsAggregate, RecordStore, Result,
    SeriesPoint, TimeRange, TimeWindow,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Records one entry per completed invocation and answers windowed queries.
///
/// Cloning is cheap and every clone shares the same log.
#[derive(Clone)]
pub struct MetricsAggregator {
    storage: Arc<dyn RecordStore>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryStorage::new()))
    }
}

impl MetricsAggregator {
    pub fn new(storage: Arc<dyn RecordStore>) -> Self {
        Self { storage }
    }

    pub async fn record(&self, record: ExecutionRecord) -> Result<()> {
        debug!(
            function_id = %record.function_id,
            execution_id = %record.execution_id,
            success = record.success,
            virtualization = %record.virtualization,
            "Recording execution"
        );
        self.storage.append(record).await
    }

    pub async fn record_count(&self) -> Result<usize> {
        self.storage.len().await
    }

    pub async fn query_system(&self, range: TimeRange) -> Result<MetricsAggregate> {
        self.query_system_window(range.window_ending(Utc::now()))
            .await
    }

    pub async fn query_system_window(&self, window: TimeWindow) -> Result<MetricsAggregate> {
        let records = self.storage.scan(window, None).await?;
        Ok(MetricsAggregate::from_records(&records))
    }

    pub async fn query_function(
        &self,
        function_id: &str,
        range: TimeRange,
    ) -> Result<FunctionMetrics> {
        self.query_function_window(function_id, range.window_ending(Utc::now()))
            .await
    }

    pub async fn query_function_window(
        &self,
        function_id: &str,
        window: TimeWindow,
    ) -> Result<FunctionMetrics> {
        let mut records = self.storage.scan(window, Some(function_id)).await?;
        // stable: equal timestamps keep append order
        records.sort_by_key(|r| r.timestamp);

        Ok(FunctionMetrics {
            aggregates: MetricsAggregate::from_records(&records),
            metrics: records.iter().map(SeriesPoint::from).collect(),
        })
    }

    /// Raw records for one function, newest first.
    pub async fn history(
        &self,
        function_id: &str,
        range: TimeRange,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut records = self
            .storage
            .scan(range.window_ending(Utc::now()), Some(function_id))
            .await?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }
}

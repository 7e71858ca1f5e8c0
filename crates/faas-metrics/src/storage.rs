use crate::{ExecutionRecord, Result, TimeWindow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Append-only log of execution records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, record: ExecutionRecord) -> Result<()>;

    /// Records inside `window`, optionally for one function, in append order.
    async fn scan(
        &self,
        window: TimeWindow,
        function_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>>;

    async fn len(&self) -> Result<usize>;
}

// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    records: Arc<RwLock<Vec<ExecutionRecord>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStorage {
    async fn append(&self, record: ExecutionRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn scan(
        &self,
        window: TimeWindow,
        function_id: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .filter(|r| function_id.map_or(true, |id| r.function_id == id))
            .cloned()
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}

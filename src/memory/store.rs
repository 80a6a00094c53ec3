//! External durable store contract and its record schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::pool::ExecutionResult;

/// One execution result in the store's schema.
///
/// `id` is the rendered dedup key, so storing the same result twice is a
/// no-op on the store side as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub pool_id: String,
    pub worker_id: String,
    pub success: bool,
    pub task: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    /// Flattened text the relevance score runs against.
    pub content: String,
}

impl From<&ExecutionResult> for MemoryRecord {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            id: result.dedup_key().to_string(),
            pool_id: result.pool_id.clone(),
            worker_id: result.worker_id.clone(),
            success: result.success,
            task: result.task.to_json(),
            output: result.output.clone(),
            error: result.error.clone(),
            duration_ms: result.duration.as_millis() as u64,
            completed_at: result.completed_at,
            content: result.searchable_text(),
        }
    }
}

/// Acknowledgement of a `store_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAck {
    pub inserted: usize,
    /// Records the store already held.
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub pool_id: Option<String>,
    #[serde(default)]
    pub success_only: bool,
}

impl SearchFilters {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if self.success_only && !record.success {
            return false;
        }
        match &self.pool_id {
            Some(pool_id) => &record.pool_id == pool_id,
            None => true,
        }
    }
}

/// Where a search hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Store,
    /// Not yet synced; read from a live pool's history.
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f64,
    pub source: HitSource,
}

/// Durable, searchable home for execution history.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert records, ignoring ids the store already holds.
    async fn store_batch(&self, records: &[MemoryRecord]) -> Result<StoreAck, StoreError>;

    /// Ranked lookup, best match first.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Cheap reachability check used before starting the sync loop.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::Task;

    #[test]
    fn record_from_result() {
        let result = ExecutionResult::succeeded(
            "p1",
            "p1-w0",
            Task::prompt("summarise logs"),
            serde_json::json!({"summary": "all quiet"}),
            Duration::from_millis(42),
        );
        let record = MemoryRecord::from(&result);

        assert_eq!(record.id, result.dedup_key().to_string());
        assert_eq!(record.duration_ms, 42);
        assert!(record.content.contains("summarise logs"));
        assert!(record.content.contains("all quiet"));
    }

    #[test]
    fn filters() {
        let failed = MemoryRecord::from(&ExecutionResult::failed(
            "p2",
            "p2-w0",
            Task::prompt("x"),
            "boom",
            Duration::ZERO,
        ));
        assert!(SearchFilters::default().matches(&failed));
        assert!(!SearchFilters { success_only: true, ..Default::default() }.matches(&failed));
        assert!(!SearchFilters { pool_id: Some("p1".into()), ..Default::default() }.matches(&failed));
    }
}

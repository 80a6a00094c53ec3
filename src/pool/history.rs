//! Bounded per-pool execution history with sync tracking.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::pool::model::{DedupKey, ExecutionResult};

/// Default number of results retained per pool.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct HistoryEntry {
    result: ExecutionResult,
    synced: bool,
}

/// Ring of recent execution results.
///
/// Entries stay until evicted by capacity. When full, the oldest synced
/// entry goes first so unsynced results survive as long as possible.
#[derive(Debug)]
pub struct ExecutionHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    evicted_unsynced: AtomicU64,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            evicted_unsynced: AtomicU64::new(0),
        }
    }

    /// Append a completed result.
    pub async fn record(&self, result: ExecutionResult) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            match entries.iter().position(|e| e.synced) {
                Some(idx) => {
                    entries.remove(idx);
                }
                None => {
                    if let Some(lost) = entries.pop_front() {
                        self.evicted_unsynced.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            pool_id = %lost.result.pool_id,
                            worker_id = %lost.result.worker_id,
                            "History full, evicted unsynced result"
                        );
                    }
                }
            }
        }
        entries.push_back(HistoryEntry {
            result,
            synced: false,
        });
    }

    /// Oldest-first batch of results not yet acknowledged by the store.
    pub async fn unsynced(&self, limit: usize) -> Vec<ExecutionResult> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| !e.synced)
            .take(limit)
            .map(|e| e.result.clone())
            .collect()
    }

    /// Flag the given results as synced. Returns how many entries changed.
    pub async fn mark_synced(&self, keys: &[DedupKey]) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let wanted: HashSet<&DedupKey> = keys.iter().collect();
        let mut entries = self.entries.lock().await;
        let mut changed = 0;
        for entry in entries.iter_mut().filter(|e| !e.synced) {
            if wanted.contains(&entry.result.dedup_key()) {
                entry.synced = true;
                changed += 1;
            }
        }
        changed
    }

    /// Most recent results, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<ExecutionResult> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.result.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn unsynced_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| !e.synced)
            .count()
    }

    /// Results lost to eviction before they were synced.
    pub fn evicted_unsynced(&self) -> u64 {
        self.evicted_unsynced.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::model::Task;

    fn result(worker: &str, n: i64) -> ExecutionResult {
        let mut r = ExecutionResult::succeeded(
            "pool-a",
            worker,
            Task::prompt(format!("task {n}")),
            serde_json::json!(n),
            Duration::from_millis(1),
        );
        r.completed_at = chrono::DateTime::from_timestamp(1_700_000_000 + n, 0).unwrap();
        r
    }

    #[tokio::test]
    async fn record_and_unsynced_oldest_first() {
        let history = ExecutionHistory::new(10);
        for n in 0..3 {
            history.record(result("w-1", n)).await;
        }
        let batch = history.unsynced(2).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].output, Some(serde_json::json!(0)));
        assert_eq!(batch[1].output, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn mark_synced_hides_entries() {
        let history = ExecutionHistory::new(10);
        history.record(result("w-1", 0)).await;
        history.record(result("w-2", 1)).await;

        let first = history.unsynced(1).await;
        let keys: Vec<_> = first.iter().map(|r| r.dedup_key()).collect();
        assert_eq!(history.mark_synced(&keys).await, 1);
        assert_eq!(history.mark_synced(&keys).await, 0);

        let rest = history.unsynced(10).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].worker_id, "w-2");
        assert_eq!(history.len().await, 2);
    }

    #[tokio::test]
    async fn eviction_prefers_synced_entries() {
        let history = ExecutionHistory::new(2);
        history.record(result("w-1", 0)).await;
        history.record(result("w-1", 1)).await;
        let second = result("w-1", 1).dedup_key();
        history.mark_synced(&[second]).await;

        history.record(result("w-1", 2)).await;

        let unsynced = history.unsynced(10).await;
        assert_eq!(unsynced.len(), 2);
        assert_eq!(unsynced[0].output, Some(serde_json::json!(0)));
        assert_eq!(history.evicted_unsynced(), 0);
    }

    #[tokio::test]
    async fn eviction_counts_lost_unsynced() {
        let history = ExecutionHistory::new(2);
        for n in 0..3 {
            history.record(result("w-1", n)).await;
        }
        assert_eq!(history.len().await, 2);
        assert_eq!(history.evicted_unsynced(), 1);
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let history = ExecutionHistory::default();
        for n in 0..5 {
            history.record(result("w-1", n)).await;
        }
        let recent = history.recent(2).await;
        assert_eq!(recent[0].output, Some(serde_json::json!(4)));
        assert_eq!(recent[1].output, Some(serde_json::json!(3)));
    }
}

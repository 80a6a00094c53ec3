//! Registry of live pools.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::PoolError;
use crate::pool::Pool;

struct PoolEntry {
    pool: Arc<dyn Pool>,
    /// Spawn order; round-robin rotates in this order.
    seq: u64,
    /// Serialises scale/close on this pool.
    op_lock: Arc<Mutex<()>>,
}

/// In-memory table of live pools, keyed by pool_id.
///
/// Closed ids are remembered for the process lifetime so an id is never
/// handed out twice and a repeated close can be told apart from an unknown id.
/// Removed pools with unsynced history are retired rather than dropped, until
/// the aggregator has stored everything they produced.
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, PoolEntry>>,
    closed: RwLock<HashSet<String>>,
    retired: RwLock<Vec<Arc<dyn Pool>>>,
    next_seq: AtomicU64,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashSet::new()),
            retired: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Generate a fresh pool id derived from the pool name.
    pub async fn allocate_id(&self, name: &str) -> String {
        let slug: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "pool" } else { slug };

        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("{slug}-{}", &suffix[..12]);
            if !self.contains(&id).await && !self.was_closed(&id).await {
                return id;
            }
        }
    }

    /// Register a spawned pool.
    pub async fn insert(&self, pool: Arc<dyn Pool>) -> Result<(), PoolError> {
        let pool_id = pool.pool_id().to_string();
        if self.was_closed(&pool_id).await {
            return Err(PoolError::Configuration {
                pool_id: Some(pool_id),
                reason: "pool id was already used by a closed pool".into(),
            });
        }

        let mut pools = self.pools.write().await;
        if pools.contains_key(&pool_id) {
            return Err(PoolError::Configuration {
                pool_id: Some(pool_id),
                reason: "pool id already registered".into(),
            });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        pools.insert(
            pool_id,
            PoolEntry {
                pool,
                seq,
                op_lock: Arc::new(Mutex::new(())),
            },
        );
        Ok(())
    }

    pub async fn get(&self, pool_id: &str) -> Result<Arc<dyn Pool>, PoolError> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .map(|e| Arc::clone(&e.pool))
            .ok_or_else(|| PoolError::NotFound {
                pool_id: pool_id.to_string(),
            })
    }

    /// Per-pool operation lock.
    pub async fn op_lock(&self, pool_id: &str) -> Option<Arc<Mutex<()>>> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .map(|e| Arc::clone(&e.op_lock))
    }

    pub async fn contains(&self, pool_id: &str) -> bool {
        self.pools.read().await.contains_key(pool_id)
    }

    /// Remove a pool and remember its id as closed. The pool is retired
    /// until its history is drained, since tasks still in flight may record.
    pub async fn remove(&self, pool_id: &str) -> Option<Arc<dyn Pool>> {
        let removed = self.pools.write().await.remove(pool_id)?;
        self.closed.write().await.insert(pool_id.to_string());
        self.retired.write().await.push(Arc::clone(&removed.pool));
        Some(removed.pool)
    }

    /// Closed pools whose history has not been fully synced, in close order.
    pub async fn retired(&self) -> Vec<Arc<dyn Pool>> {
        self.retired.read().await.clone()
    }

    /// Forget retired pools with no task in flight and nothing left to sync.
    /// Returns how many went.
    pub async fn prune_retired(&self) -> usize {
        let retired = self.retired().await;
        let mut drained = HashSet::new();
        for pool in &retired {
            if pool.core().in_flight() == 0 && pool.history().unsynced_count().await == 0 {
                drained.insert(pool.pool_id().to_string());
            }
        }
        if drained.is_empty() {
            return 0;
        }
        let mut retired = self.retired.write().await;
        let before = retired.len();
        retired.retain(|p| !drained.contains(p.pool_id()));
        before - retired.len()
    }

    pub async fn was_closed(&self, pool_id: &str) -> bool {
        self.closed.read().await.contains(pool_id)
    }

    /// All registered pools in spawn order.
    pub async fn pools(&self) -> Vec<Arc<dyn Pool>> {
        let pools = self.pools.read().await;
        let mut entries: Vec<&PoolEntry> = pools.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| Arc::clone(&e.pool)).collect()
    }

    /// Pools that currently accept tasks, in spawn order.
    pub async fn routable(&self) -> Vec<Arc<dyn Pool>> {
        let mut out = Vec::new();
        for pool in self.pools().await {
            if pool.status().await.accepts_tasks() {
                out.push(pool);
            }
        }
        out
    }

    pub async fn ids(&self) -> Vec<String> {
        self.pools()
            .await
            .iter()
            .map(|p| p.pool_id().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::pool::{
        BackendType, ExecutionResult, HealthStatus, PoolConfig, PoolCore, PoolStatus, ScaleAck,
        Task,
    };

    struct FakePool {
        core: PoolCore,
    }

    impl FakePool {
        async fn active(id: &str) -> Arc<dyn Pool> {
            let core = PoolCore::new(id, PoolConfig::new(id, BackendType::Direct, "fake"));
            core.transition(PoolStatus::Active, None).await.unwrap();
            Arc::new(Self { core })
        }
    }

    #[async_trait]
    impl Pool for FakePool {
        fn core(&self) -> &PoolCore {
            &self.core
        }
        async fn spawn(&self) -> Result<(), PoolError> {
            Ok(())
        }
        async fn execute(&self, _task: Task) -> Result<ExecutionResult, PoolError> {
            unimplemented!("not used in registry tests")
        }
        async fn scale(&self, _target: usize) -> Result<ScaleAck, PoolError> {
            unimplemented!("not used in registry tests")
        }
        async fn close(&self) -> Result<(), PoolError> {
            self.core.begin_close().await;
            self.core.finish_close().await;
            Ok(())
        }
        async fn health(&self) -> HealthStatus {
            self.core.local_health().await
        }
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = PoolRegistry::new();
        registry.insert(FakePool::active("p1").await).await.unwrap();

        assert!(registry.get("p1").await.is_ok());
        assert!(matches!(
            registry.get("nope").await,
            Err(PoolError::NotFound { .. })
        ));

        assert!(registry.remove("p1").await.is_some());
        assert!(registry.was_closed("p1").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let registry = PoolRegistry::new();
        registry.insert(FakePool::active("p1").await).await.unwrap();
        let err = registry.insert(FakePool::active("p1").await).await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration { .. }));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn closed_ids_never_reused() {
        let registry = PoolRegistry::new();
        registry.insert(FakePool::active("p1").await).await.unwrap();
        registry.remove("p1").await;
        assert!(registry.insert(FakePool::active("p1").await).await.is_err());
    }

    #[tokio::test]
    async fn pools_in_spawn_order() {
        let registry = PoolRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.insert(FakePool::active(id).await).await.unwrap();
        }
        assert_eq!(registry.ids().await, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn routable_skips_closing() {
        let registry = PoolRegistry::new();
        registry.insert(FakePool::active("p1").await).await.unwrap();
        registry.insert(FakePool::active("p2").await).await.unwrap();
        registry.get("p1").await.unwrap().core().begin_close().await;

        let routable = registry.routable().await;
        assert_eq!(routable.len(), 1);
        assert_eq!(routable[0].pool_id(), "p2");
    }

    #[tokio::test]
    async fn allocate_id_uses_slug() {
        let registry = PoolRegistry::new();
        let a = registry.allocate_id("Code Review!").await;
        let b = registry.allocate_id("Code Review!").await;
        assert!(a.starts_with("code-review-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn removed_pool_retired_until_history_drained() {
        let registry = PoolRegistry::new();
        let pool = FakePool::active("p1").await;
        registry.insert(Arc::clone(&pool)).await.unwrap();

        let result = ExecutionResult::succeeded(
            "p1",
            "p1-w1",
            Task::prompt("late"),
            serde_json::json!("ok"),
            std::time::Duration::from_millis(1),
        );
        let key = result.dedup_key();
        pool.history().record(result).await;

        registry.remove("p1").await;
        assert!(registry.pools().await.is_empty());
        assert_eq!(registry.retired().await.len(), 1);
        assert_eq!(registry.prune_retired().await, 0);

        pool.history().mark_synced(&[key]).await;
        assert_eq!(registry.prune_retired().await, 1);
        assert!(registry.retired().await.is_empty());
    }
}

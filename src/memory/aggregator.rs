//! Periodic reconciliation of per-pool execution history into the store.
//!
//! A cycle never overlaps itself. History entries are only marked synced
//! after the store acknowledges them, so a failed or timed-out write is
//! retried by the next cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::relevance::{lexical_score, query_terms, rank};
use super::store::{HitSource, MemoryRecord, MemoryStore, SearchFilters, SearchHit};
use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::manager::PoolManager;
use crate::pool::{DedupKey, Pool};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub pool_id: String,
    pub error: String,
}

/// Outcome of one `collect_and_sync` cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub pools_scanned: usize,
    /// Unsynced results pulled from pool histories.
    pub collected: usize,
    /// Newly inserted into the store.
    pub stored: usize,
    /// Already present, either in the store or in the seen-key set.
    pub duplicates: usize,
    pub pools_failed: usize,
    pub failures: Vec<SyncFailure>,
    /// Another cycle was still running.
    pub skipped: bool,
    /// Set when the store reported a condition retrying cannot fix.
    pub fatal: Option<String>,
}

/// Bounded FIFO set of dedup keys already acknowledged by the store.
struct SeenKeys {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.set.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.set.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

/// Clears the running flag when a cycle ends, even on panic.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MemoryAggregator {
    store: Arc<dyn MemoryStore>,
    config: SyncConfig,
    running: AtomicBool,
    seen: StdMutex<SeenKeys>,
    cycles: AtomicU64,
}

impl MemoryAggregator {
    pub fn new(store: Arc<dyn MemoryStore>, config: SyncConfig) -> Self {
        let seen = SeenKeys::new(config.seen_capacity);
        Self {
            store,
            config,
            running: AtomicBool::new(false),
            seen: StdMutex::new(seen),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Completed (non-skipped) cycles so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Pull unsynced results from every live or not-yet-drained closed pool
    /// and push them to the store. Per-pool failures are counted, never raised.
    pub async fn collect_and_sync(&self, manager: &PoolManager) -> SyncStats {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Sync cycle already running, skipping");
            return SyncStats {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = CycleGuard(&self.running);
        let started = Instant::now();
        let mut stats = SyncStats::default();

        for pool in manager.history_sources().await {
            stats.pools_scanned += 1;
            if let Err(e) = self.sync_pool(pool.as_ref(), &mut stats).await {
                stats.pools_failed += 1;
                stats.failures.push(SyncFailure {
                    pool_id: pool.pool_id().to_string(),
                    error: e.to_string(),
                });
                if e.is_fatal() {
                    error!(pool_id = %pool.pool_id(), error = %e, "Memory store unusable, aborting sync cycle");
                    stats.fatal = Some(e.to_string());
                    break;
                }
                warn!(pool_id = %pool.pool_id(), error = %e, "Pool sync failed, will retry next cycle");
            }
        }

        manager.release_drained().await;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            pools = stats.pools_scanned,
            collected = stats.collected,
            stored = stats.stored,
            duplicates = stats.duplicates,
            failed = stats.pools_failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync cycle complete"
        );
        stats
    }

    async fn sync_pool(&self, pool: &dyn Pool, stats: &mut SyncStats) -> Result<(), StoreError> {
        let history = pool.history();
        let batch_size = self.config.batch_size.max(1);

        for _ in 0..self.config.max_batches_per_cycle.max(1) {
            let batch = history.unsynced(batch_size).await;
            if batch.is_empty() {
                break;
            }
            stats.collected += batch.len();

            let keys: Vec<DedupKey> = batch.iter().map(|r| r.dedup_key()).collect();
            let records: Vec<MemoryRecord> = {
                let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                batch
                    .iter()
                    .map(MemoryRecord::from)
                    .filter(|r| !seen.contains(&r.id))
                    .collect()
            };
            stats.duplicates += batch.len() - records.len();

            if !records.is_empty() {
                let timeout = self.config.store_timeout;
                let ack = tokio::time::timeout(timeout, self.store.store_batch(&records))
                    .await
                    .map_err(|_| StoreError::Timeout(timeout))??;
                stats.stored += ack.inserted;
                stats.duplicates += ack.duplicates;

                let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                for record in records {
                    seen.insert(record.id);
                }
            }

            history.mark_synced(&keys).await;
            debug!(pool_id = %pool.pool_id(), batch = keys.len(), "Batch synced");

            if batch.len() < batch_size {
                break;
            }
        }
        Ok(())
    }

    /// Run `collect_and_sync` every `interval` until the handle is shut down.
    ///
    /// Fails only if the store does not answer `ping`. Ticks that land while
    /// a cycle is still running are skipped, not queued.
    pub async fn start_periodic_sync(
        self: Arc<Self>,
        manager: Arc<PoolManager>,
        interval: Duration,
    ) -> Result<SyncHandle, StoreError> {
        tokio::time::timeout(self.config.store_timeout, self.store.ping())
            .await
            .map_err(|_| StoreError::Timeout(self.config.store_timeout))??;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(interval_ms = period.as_millis() as u64, "Periodic sync started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = self.collect_and_sync(&manager).await;
                        if let Some(reason) = stats.fatal {
                            error!(reason = %reason, "Periodic sync stopped");
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Periodic sync stopped");
        });

        Ok(SyncHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Ranked search over the store, overlaid with unsynced live results.
    pub async fn cross_pool_search(
        &self,
        query: &str,
        manager: &PoolManager,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.cross_pool_search_with(query, manager, &SearchFilters::default(), limit, true)
            .await
    }

    /// Store results are authoritative and win on id collisions.
    pub async fn cross_pool_search_with(
        &self,
        query: &str,
        manager: &PoolManager,
        filters: &SearchFilters,
        limit: usize,
        include_unsynced: bool,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let timeout = self.config.store_timeout;
        let stored = tokio::time::timeout(timeout, self.store.search(query, filters, limit))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        let mut merged: HashMap<String, SearchHit> = stored
            .into_iter()
            .map(|hit| (hit.record.id.clone(), hit))
            .collect();

        if include_unsynced {
            let terms = query_terms(query);
            for pool in manager.history_sources().await {
                let history = pool.history();
                for result in history.unsynced(history.capacity()).await {
                    let record = MemoryRecord::from(&result);
                    if merged.contains_key(&record.id) || !filters.matches(&record) {
                        continue;
                    }
                    let score = lexical_score(&terms, &record.content);
                    if !terms.is_empty() && score == 0.0 {
                        continue;
                    }
                    merged.insert(
                        record.id.clone(),
                        SearchHit {
                            record,
                            score,
                            source: HitSource::Live,
                        },
                    );
                }
            }
        }

        let mut hits: Vec<SearchHit> = merged.into_values().collect();
        rank(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Handle to a running periodic sync loop.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal the loop and wait for it. An in-flight cycle runs to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Periodic sync task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

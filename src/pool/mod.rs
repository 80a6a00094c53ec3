//! Pool contract and shared per-pool state.
//!
//! Core components:
//! - `model`: PoolConfig, Task, ExecutionResult, HealthStatus
//! - `state`: Pool status state machine (Spawning → Active → Closing → Closed)
//! - `history`: Bounded execution history with sync tracking
//! - `registry`: In-memory table of live pools

pub mod history;
pub mod model;
pub mod registry;
pub mod state;

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::PoolError;

pub use history::{DEFAULT_HISTORY_CAPACITY, ExecutionHistory};
pub use model::{
    BackendType, DedupKey, ExecutionResult, HealthStatus, PoolConfig, PoolSummary, ScaleAck,
    Task,
};
pub use registry::PoolRegistry;
pub use state::{PoolState, PoolStatus};

/// Uniform lifecycle/execution contract implemented by every backend.
///
/// The registry, router and manager only ever hold `Arc<dyn Pool>`.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Shared state every backend embeds.
    fn core(&self) -> &PoolCore;

    /// Allocate workers. Fails only if no worker could start.
    async fn spawn(&self) -> Result<(), PoolError>;

    /// Run one task to completion within the pool's deadline.
    async fn execute(&self, task: Task) -> Result<ExecutionResult, PoolError>;

    /// Move the worker count toward `target`, clamped to the config bounds.
    async fn scale(&self, target: usize) -> Result<ScaleAck, PoolError>;

    /// Release workers. Idempotent.
    async fn close(&self) -> Result<(), PoolError>;

    /// Probe the pool. Never fails; internal problems show up as degraded.
    async fn health(&self) -> HealthStatus;

    fn pool_id(&self) -> &str {
        self.core().pool_id()
    }

    fn config(&self) -> &PoolConfig {
        self.core().config()
    }

    fn backend_type(&self) -> BackendType {
        self.core().config().pool_type
    }

    fn history(&self) -> &ExecutionHistory {
        self.core().history()
    }

    async fn status(&self) -> PoolStatus {
        self.core().status().await
    }

    async fn summary(&self) -> PoolSummary {
        self.core().summary().await
    }
}

/// State shared by all backends: identity, status, counters, history.
#[derive(Debug)]
pub struct PoolCore {
    pool_id: String,
    config: PoolConfig,
    created_at: DateTime<Utc>,
    state: RwLock<PoolState>,
    in_flight: AtomicUsize,
    history: ExecutionHistory,
}

impl PoolCore {
    pub fn new(pool_id: impl Into<String>, config: PoolConfig) -> Self {
        let capacity = config
            .setting_u64("history_capacity")
            .map(|c| c as usize)
            .unwrap_or(DEFAULT_HISTORY_CAPACITY);
        Self {
            pool_id: pool_id.into(),
            config,
            created_at: Utc::now(),
            state: RwLock::new(PoolState::new()),
            in_flight: AtomicUsize::new(0),
            history: ExecutionHistory::new(capacity),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub async fn status(&self) -> PoolStatus {
        self.state.read().await.status
    }

    pub async fn worker_count(&self) -> usize {
        self.state.read().await.worker_count
    }

    pub async fn snapshot(&self) -> PoolState {
        self.state.read().await.clone()
    }

    /// Mutate state under the write lock.
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PoolState) -> R,
    {
        let mut state = self.state.write().await;
        f(&mut state)
    }

    /// Transition status, mapping an illegal move to `Unavailable`.
    pub async fn transition(
        &self,
        status: PoolStatus,
        reason: Option<String>,
    ) -> Result<(), PoolError> {
        let mut state = self.state.write().await;
        let from = state.status;
        state
            .transition_to(status, reason)
            .map_err(|_| PoolError::Unavailable {
                pool_id: self.pool_id.clone(),
                status: from,
            })?;
        if from != status {
            tracing::debug!(pool_id = %self.pool_id, from = %from, to = %status, "Pool status changed");
        }
        Ok(())
    }

    pub async fn set_worker_count(&self, count: usize) {
        self.state.write().await.worker_count = count;
    }

    pub async fn mark_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(pool_id = %self.pool_id, reason = %reason, "Pool degraded");
        self.state.write().await.mark_degraded(reason);
    }

    pub async fn record_error(&self, reason: impl Into<String>) {
        self.state.write().await.last_error = Some(reason.into());
    }

    /// Fail with `Unavailable` unless the pool currently accepts tasks.
    pub async fn ensure_accepting(&self) -> Result<(), PoolError> {
        let status = self.status().await;
        if status.accepts_tasks() {
            Ok(())
        } else {
            Err(PoolError::Unavailable {
                pool_id: self.pool_id.clone(),
                status,
            })
        }
    }

    /// Mark closing. Returns `false` if the pool is already closed.
    pub async fn begin_close(&self) -> bool {
        let mut state = self.state.write().await;
        match state.status {
            PoolStatus::Closed => false,
            PoolStatus::Closing => true,
            _ => {
                let _ = state.transition_to(PoolStatus::Closing, Some("close requested".into()));
                true
            }
        }
    }

    pub async fn finish_close(&self) {
        let mut state = self.state.write().await;
        let _ = state.transition_to(PoolStatus::Closed, None);
        state.worker_count = 0;
    }

    /// Count a task as in flight until the guard drops.
    pub fn begin_task(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: &self.in_flight,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Health as seen from local state alone.
    pub async fn local_health(&self) -> HealthStatus {
        let state = self.state.read().await;
        HealthStatus {
            pool_id: self.pool_id.clone(),
            status: state.status,
            worker_count: state.worker_count,
            in_flight: self.in_flight(),
            last_error: state.last_error.clone(),
            checked_at: Utc::now(),
        }
    }

    pub async fn summary(&self) -> PoolSummary {
        let state = self.state.read().await;
        PoolSummary {
            pool_id: self.pool_id.clone(),
            name: self.config.name.clone(),
            backend_type: self.config.pool_type,
            status: state.status,
            worker_count: state.worker_count,
            created_at: self.created_at,
        }
    }
}

/// Decrements the in-flight counter on drop.
pub struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

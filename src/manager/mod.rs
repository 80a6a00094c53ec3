//! Pool manager: the facade composing registry, router, bus and backends.
//!
//! The manager never retries a failed route or execution against another
//! pool. Errors carry the pool id and class so callers can decide.

pub mod routes;

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::BackendFactory;
use crate::bus::{Message, MessageBus, MessagePayload, MessageType};
use crate::config::ManagerConfig;
use crate::error::{ErrorClass, PoolError};
use crate::pool::{
    ExecutionResult, HealthStatus, Pool, PoolConfig, PoolRegistry, PoolStatus, PoolSummary,
    ScaleAck, Task,
};
use crate::router::{Router, RoutingStrategy};

/// Result of `route_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedResult {
    pub pool_id: String,
    pub strategy: RoutingStrategy,
    /// The affinity pool was gone; callers should adopt `pool_id`.
    pub affinity_changed: bool,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseFailure {
    pub pool_id: String,
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of `close_all`. Per-pool failures are contained here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseSummary {
    pub closed: Vec<String>,
    pub failed: Vec<CloseFailure>,
}

impl CloseSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct PoolManager {
    registry: PoolRegistry,
    router: Router,
    bus: Arc<MessageBus>,
    factory: BackendFactory,
    config: ManagerConfig,
    /// Handed to bus handlers so they don't keep the manager alive.
    self_ref: Weak<PoolManager>,
}

impl PoolManager {
    pub fn new(factory: BackendFactory, bus: Arc<MessageBus>, config: ManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: PoolRegistry::new(),
            router: Router::new(config.health_timeout),
            bus,
            factory,
            config,
            self_ref: weak.clone(),
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub async fn pool(&self, pool_id: &str) -> Result<Arc<dyn Pool>, PoolError> {
        self.registry.get(pool_id).await
    }

    /// Registered pools in spawn order.
    pub async fn live_pools(&self) -> Vec<Arc<dyn Pool>> {
        self.registry.pools().await
    }

    /// Pools whose history may still hold unsynced results: live pools in
    /// spawn order, then closed pools not yet drained.
    pub async fn history_sources(&self) -> Vec<Arc<dyn Pool>> {
        let mut pools = self.registry.pools().await;
        pools.extend(self.registry.retired().await);
        pools
    }

    /// Release closed pools whose history has been fully synced.
    pub async fn release_drained(&self) -> usize {
        let released = self.registry.prune_retired().await;
        if released > 0 {
            debug!(released, "Released drained closed pools");
        }
        released
    }

    /// Validate, build, spawn and register a pool. Returns its id.
    pub async fn spawn_pool(&self, config: PoolConfig) -> Result<String, PoolError> {
        config.validate()?;
        let pool_type = config.pool_type;
        let name = config.name.clone();
        let pool_id = self.registry.allocate_id(&name).await;

        let pool = self
            .factory
            .create(&pool_id, config)
            .map_err(|e| e.with_pool_id(&pool_id))?;

        if let Err(e) = pool.spawn().await {
            warn!(pool_id = %pool_id, backend = %pool_type, error = %e, "Pool spawn failed");
            return Err(e.with_pool_id(&pool_id));
        }

        if let Err(e) = self.registry.insert(Arc::clone(&pool)).await {
            let _ = pool.close().await;
            return Err(e);
        }

        self.bus.register(&pool_id, &[]).await;
        if self.config.delegation_enabled {
            self.subscribe_delegation(&pool_id).await;
        }
        self.announce(Message::broadcast(
            &pool_id,
            MessagePayload::PoolCreated {
                backend_type: pool_type,
                name,
            },
        ))
        .await;

        let workers = pool.core().worker_count().await;
        let status = pool.status().await;
        info!(
            pool_id = %pool_id,
            backend = %pool_type,
            workers,
            status = %status,
            "Pool spawned"
        );
        Ok(pool_id)
    }

    pub async fn execute_on_pool(&self, pool_id: &str, task: Task) -> Result<ExecutionResult, PoolError> {
        let pool = self.registry.get(pool_id).await?;
        pool.core().ensure_accepting().await?;

        let result = pool.execute(task).await?;
        self.announce(Message::broadcast(
            pool_id,
            MessagePayload::TaskCompleted {
                worker_id: result.worker_id.clone(),
                success: result.success,
                duration_ms: result.duration.as_millis() as u64,
            },
        ))
        .await;
        Ok(result)
    }

    /// Pick a pool with `strategy` and execute there. No internal retry.
    pub async fn route_task(
        &self,
        task: Task,
        strategy: RoutingStrategy,
        affinity_key: Option<&str>,
    ) -> Result<RoutedResult, PoolError> {
        let candidates = self.registry.routable().await;
        let decision = self.router.select(&candidates, strategy, affinity_key).await?;
        let pool_id = decision.pool.pool_id().to_string();
        debug!(pool_id = %pool_id, strategy = %decision.strategy, "Task routed");

        let result = self.execute_on_pool(&pool_id, task).await?;
        Ok(RoutedResult {
            pool_id,
            strategy: decision.strategy,
            affinity_changed: decision.affinity_changed,
            result,
        })
    }

    pub async fn scale_pool(&self, pool_id: &str, target: usize) -> Result<ScaleAck, PoolError> {
        let lock = self
            .registry
            .op_lock(pool_id)
            .await
            .ok_or_else(|| PoolError::NotFound {
                pool_id: pool_id.to_string(),
            })?;
        let _guard = lock.lock().await;
        let pool = self.registry.get(pool_id).await?;

        let ack = pool.scale(target).await?;
        info!(pool_id = %pool_id, previous = ack.previous, current = ack.current, "Pool scaled");
        self.announce(Message::broadcast(
            pool_id,
            MessagePayload::StatusUpdate {
                status: pool.status().await,
                worker_count: ack.current,
                detail: Some(format!("scaled from {} to {}", ack.previous, ack.current)),
            },
        ))
        .await;
        Ok(ack)
    }

    /// Close one pool. Closing an already-closed pool succeeds; an id that
    /// never existed is `NotFound`. A failed close leaves the pool registered.
    pub async fn close_pool(&self, pool_id: &str) -> Result<(), PoolError> {
        let Some(lock) = self.registry.op_lock(pool_id).await else {
            return self.already_closed(pool_id).await;
        };
        let _guard = lock.lock().await;
        let pool = match self.registry.get(pool_id).await {
            Ok(pool) => pool,
            Err(_) => return self.already_closed(pool_id).await,
        };

        match tokio::time::timeout(self.config.close_timeout, pool.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(pool_id = %pool_id, error = %e, "Pool close failed");
                return Err(e);
            }
            Err(_) => {
                warn!(pool_id = %pool_id, "Pool close timed out");
                return Err(PoolError::Timeout {
                    pool_id: pool_id.to_string(),
                    timeout: self.config.close_timeout,
                });
            }
        }

        self.registry.remove(pool_id).await;
        self.bus.unregister(pool_id).await;
        self.announce(Message::broadcast(
            pool_id,
            MessagePayload::PoolClosed {
                reason: Some("close requested".into()),
            },
        ))
        .await;
        info!(pool_id = %pool_id, "Pool closed");
        Ok(())
    }

    async fn already_closed(&self, pool_id: &str) -> Result<(), PoolError> {
        if self.registry.was_closed(pool_id).await {
            Ok(())
        } else {
            Err(PoolError::NotFound {
                pool_id: pool_id.to_string(),
            })
        }
    }

    /// Close every pool concurrently, collecting failures instead of aborting.
    pub async fn close_all(&self) -> CloseSummary {
        let ids = self.registry.ids().await;
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let outcome = self.close_pool(&id).await;
            (id, outcome)
        }))
        .await;

        let mut summary = CloseSummary::default();
        for (pool_id, outcome) in outcomes {
            match outcome {
                Ok(()) => summary.closed.push(pool_id),
                Err(e) => summary.failed.push(CloseFailure {
                    pool_id,
                    class: e.class(),
                    message: e.to_string(),
                }),
            }
        }
        info!(closed = summary.closed.len(), failed = summary.failed.len(), "Closed all pools");
        summary
    }

    /// Summaries of every pool that is not closed.
    pub async fn list_pools(&self) -> Vec<PoolSummary> {
        let mut out = Vec::new();
        for pool in self.registry.pools().await {
            let summary = pool.summary().await;
            if summary.status != PoolStatus::Closed {
                out.push(summary);
            }
        }
        out
    }

    /// Health of every registered pool. Slow pools report as degraded, never omitted.
    pub async fn health_report(&self) -> Vec<HealthStatus> {
        let timeout = self.config.health_timeout;
        let pools = self.registry.pools().await;
        join_all(pools.iter().map(|pool| async move {
            match tokio::time::timeout(timeout, pool.health()).await {
                Ok(health) => health,
                Err(_) => {
                    warn!(pool_id = %pool.pool_id(), "Health check timed out");
                    HealthStatus::unknown(
                        pool.pool_id(),
                        format!("health check timed out after {}", fmt_duration(timeout)),
                    )
                }
            }
        }))
        .await
    }

    /// Publish a lifecycle message. Bus problems never fail the caller.
    async fn announce(&self, message: Message) {
        if let Err(e) = self.bus.publish(message).await {
            warn!(error = %e, "Failed to publish lifecycle message");
        }
    }

    async fn subscribe_delegation(&self, pool_id: &str) {
        let manager = self.self_ref.clone();
        let owner = pool_id.to_string();
        self.bus
            .subscribe(pool_id, MessageType::TaskDelegate, move |message: Message| {
                let manager = manager.clone();
                let owner = owner.clone();
                async move {
                    match manager.upgrade() {
                        Some(manager) => manager.handle_delegation(&owner, message).await,
                        None => Ok(()),
                    }
                }
            })
            .await;
    }

    /// Run a delegated task on `pool_id` and share the outcome with the requester.
    async fn handle_delegation(&self, pool_id: &str, message: Message) -> anyhow::Result<()> {
        let MessagePayload::TaskDelegate { task, reply_to } = message.payload else {
            return Ok(());
        };
        let reply_to = reply_to.unwrap_or(message.source_pool_id);
        debug!(pool_id = %pool_id, requester = %reply_to, "Handling delegated task");

        let payload = match self.execute_on_pool(pool_id, task).await {
            Ok(result) => MessagePayload::ResultShare {
                result: Some(result),
                error: None,
                request_id: Some(message.id),
            },
            Err(e) => MessagePayload::ResultShare {
                result: None,
                error: Some(e.to_string()),
                request_id: Some(message.id),
            },
        };
        self.bus
            .publish(Message::direct(pool_id, reply_to, payload))
            .await?;
        Ok(())
    }
}

fn fmt_duration(d: Duration) -> String {
    if d.as_secs() > 0 && d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

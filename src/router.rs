//! Strategy-driven pool selection.
//!
//! Strategies are decisions over the caller-supplied candidate set; the
//! router never retries and never touches the registry itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::pool::Pool;

/// Default bound on each least-loaded health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
    Affinity,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::Random => "random",
            Self::Affinity => "affinity",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "random" => Ok(Self::Random),
            "affinity" => Ok(Self::Affinity),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// Outcome of a routing decision.
pub struct RouteDecision {
    pub pool: Arc<dyn Pool>,
    /// Strategy that actually picked the pool.
    pub strategy: RoutingStrategy,
    /// Affinity could not be honoured; the caller should adopt the new pool id.
    pub affinity_changed: bool,
}

impl std::fmt::Debug for RouteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDecision")
            .field("pool_id", &self.pool.pool_id())
            .field("strategy", &self.strategy)
            .field("affinity_changed", &self.affinity_changed)
            .finish()
    }
}

pub struct Router {
    cursor: AtomicUsize,
    health_timeout: Duration,
}

impl Router {
    pub fn new(health_timeout: Duration) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            health_timeout,
        }
    }

    /// Pick a pool from `candidates` (active pools in spawn order).
    pub async fn select(
        &self,
        candidates: &[Arc<dyn Pool>],
        strategy: RoutingStrategy,
        affinity_key: Option<&str>,
    ) -> Result<RouteDecision, PoolError> {
        if candidates.is_empty() {
            return Err(PoolError::NoAvailablePool);
        }

        let decision = match strategy {
            RoutingStrategy::RoundRobin => RouteDecision {
                pool: self.round_robin(candidates),
                strategy,
                affinity_changed: false,
            },
            RoutingStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                RouteDecision {
                    pool: Arc::clone(&candidates[idx]),
                    strategy,
                    affinity_changed: false,
                }
            }
            RoutingStrategy::LeastLoaded => RouteDecision {
                pool: self.least_loaded(candidates).await,
                strategy,
                affinity_changed: false,
            },
            RoutingStrategy::Affinity => {
                let pinned = affinity_key
                    .and_then(|key| candidates.iter().find(|p| p.pool_id() == key));
                match pinned {
                    Some(pool) => RouteDecision {
                        pool: Arc::clone(pool),
                        strategy,
                        affinity_changed: false,
                    },
                    None => {
                        let pool = self.least_loaded(candidates).await;
                        tracing::debug!(
                            previous = ?affinity_key,
                            pool_id = %pool.pool_id(),
                            "Affinity target gone, falling back to least loaded"
                        );
                        RouteDecision {
                            pool,
                            strategy: RoutingStrategy::LeastLoaded,
                            affinity_changed: true,
                        }
                    }
                }
            }
        };
        Ok(decision)
    }

    /// One atomic read-modify-write per call; concurrent callers never share a slot.
    fn round_robin(&self, candidates: &[Arc<dyn Pool>]) -> Arc<dyn Pool> {
        let slot = self.cursor.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&candidates[slot % candidates.len()])
    }

    /// Minimum reported worker count; ties go to the lexically smaller pool id.
    async fn least_loaded(&self, candidates: &[Arc<dyn Pool>]) -> Arc<dyn Pool> {
        let probes = candidates.iter().map(|pool| async move {
            let load = tokio::time::timeout(self.health_timeout, pool.health())
                .await
                .map(|h| h.worker_count)
                .unwrap_or_else(|_| {
                    tracing::warn!(pool_id = %pool.pool_id(), "Health probe timed out during routing");
                    usize::MAX
                });
            (load, pool)
        });
        let mut loads = join_all(probes).await;
        loads.sort_by(|(a_load, a), (b_load, b)| {
            a_load.cmp(b_load).then_with(|| a.pool_id().cmp(b.pool_id()))
        });
        Arc::clone(loads[0].1)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::pool::{
        BackendType, ExecutionResult, HealthStatus, PoolConfig, PoolCore, PoolStatus, ScaleAck,
        Task,
    };

    struct LoadPool {
        core: PoolCore,
        hang: bool,
    }

    async fn pool(id: &str, workers: usize) -> Arc<dyn Pool> {
        let core = PoolCore::new(id, PoolConfig::new(id, BackendType::Direct, "t").with_workers(1, 10));
        core.transition(PoolStatus::Active, None).await.unwrap();
        core.set_worker_count(workers).await;
        Arc::new(LoadPool { core, hang: false })
    }

    #[async_trait]
    impl Pool for LoadPool {
        fn core(&self) -> &PoolCore {
            &self.core
        }
        async fn spawn(&self) -> Result<(), PoolError> {
            Ok(())
        }
        async fn execute(&self, _task: Task) -> Result<ExecutionResult, PoolError> {
            unimplemented!("routing tests never execute")
        }
        async fn scale(&self, _target: usize) -> Result<ScaleAck, PoolError> {
            unimplemented!("routing tests never scale")
        }
        async fn close(&self) -> Result<(), PoolError> {
            Ok(())
        }
        async fn health(&self) -> HealthStatus {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.core.local_health().await
        }
    }

    #[tokio::test]
    async fn empty_candidates_is_no_available_pool() {
        let router = Router::default();
        for strategy in [RoutingStrategy::RoundRobin, RoutingStrategy::LeastLoaded] {
            let err = router.select(&[], strategy, None).await.unwrap_err();
            assert!(matches!(err, PoolError::NoAvailablePool));
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_in_order() {
        let router = Router::default();
        let pools = vec![pool("p1", 1).await, pool("p2", 1).await, pool("p3", 1).await];
        let mut seen = Vec::new();
        for _ in 0..6 {
            let d = router.select(&pools, RoutingStrategy::RoundRobin, None).await.unwrap();
            seen.push(d.pool.pool_id().to_string());
        }
        assert_eq!(seen, vec!["p1", "p2", "p3", "p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn round_robin_is_fair_under_concurrency() {
        let router = Arc::new(Router::default());
        let pools = Arc::new(vec![pool("a", 1).await, pool("b", 1).await, pool("c", 1).await]);

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let router = Arc::clone(&router);
                let pools = Arc::clone(&pools);
                tokio::spawn(async move {
                    router
                        .select(&pools, RoutingStrategy::RoundRobin, None)
                        .await
                        .unwrap()
                        .pool
                        .pool_id()
                        .to_string()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            *counts.entry(h.await.unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 10));
    }

    #[tokio::test]
    async fn least_loaded_breaks_ties_by_id() {
        let router = Router::default();
        let pools = vec![pool("zeta", 2).await, pool("beta", 1).await, pool("alpha", 1).await];
        let d = router.select(&pools, RoutingStrategy::LeastLoaded, None).await.unwrap();
        assert_eq!(d.pool.pool_id(), "alpha");
    }

    #[tokio::test]
    async fn least_loaded_skips_hung_probe() {
        let router = Router::new(Duration::from_millis(20));
        let core = PoolCore::new("hung", PoolConfig::new("hung", BackendType::Direct, "t"));
        core.transition(PoolStatus::Active, None).await.unwrap();
        let hung: Arc<dyn Pool> = Arc::new(LoadPool { core, hang: true });

        let pools = vec![hung, pool("busy", 5).await];
        let d = router.select(&pools, RoutingStrategy::LeastLoaded, None).await.unwrap();
        assert_eq!(d.pool.pool_id(), "busy");
    }

    #[tokio::test]
    async fn affinity_sticks_then_falls_back() {
        let router = Router::default();
        let pools = vec![pool("p1", 3).await, pool("p2", 1).await];

        let d = router.select(&pools, RoutingStrategy::Affinity, Some("p1")).await.unwrap();
        assert_eq!(d.pool.pool_id(), "p1");
        assert!(!d.affinity_changed);

        let d = router.select(&pools, RoutingStrategy::Affinity, Some("gone")).await.unwrap();
        assert_eq!(d.pool.pool_id(), "p2");
        assert!(d.affinity_changed);
    }

    #[tokio::test]
    async fn random_picks_a_candidate() {
        let router = Router::default();
        let pools = vec![pool("p1", 1).await, pool("p2", 1).await];
        for _ in 0..10 {
            let d = router.select(&pools, RoutingStrategy::Random, None).await.unwrap();
            assert!(["p1", "p2"].contains(&d.pool.pool_id()));
        }
    }

    #[test]
    fn strategy_parse() {
        assert_eq!("least-loaded".parse::<RoutingStrategy>().unwrap(), RoutingStrategy::LeastLoaded);
        assert_eq!(RoutingStrategy::RoundRobin.to_string(), "round_robin");
        assert!("fastest".parse::<RoutingStrategy>().is_err());
    }
}

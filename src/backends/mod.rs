//! Pool backends.
//!
//! - `direct`: workers on a local `WorkerRuntime`
//! - `delegated`: thin client over a remote manager with a fixed worker group
//! - `cluster`: job units on a cluster scheduler

pub mod cluster;
pub mod delegated;
pub mod direct;

use std::sync::Arc;

use crate::error::PoolError;
use crate::pool::{BackendType, Pool, PoolConfig};
use crate::runtime::WorkerRuntime;

pub use cluster::{ClusterApi, ClusterPool, JobStatus, JobTemplate, LocalCluster};
pub use delegated::{
    DELEGATED_WORKER_COUNT, DelegatedPool, ErrorBody, HttpRemoteClient, RemoteManagerClient,
};
pub use direct::DirectPool;

/// Builds the backend for a pool type from the collaborators it was given.
#[derive(Clone)]
pub struct BackendFactory {
    runtime: Arc<dyn WorkerRuntime>,
    remote: Option<Arc<dyn RemoteManagerClient>>,
    cluster: Option<Arc<dyn ClusterApi>>,
}

impl BackendFactory {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self {
            runtime,
            remote: None,
            cluster: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteManagerClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Whether a pool type can be built with the configured collaborators.
    pub fn supports(&self, pool_type: BackendType) -> bool {
        match pool_type {
            BackendType::Direct => true,
            BackendType::Delegated => self.remote.is_some(),
            BackendType::Cluster => self.cluster.is_some(),
        }
    }

    /// Construct an unspawned pool.
    pub fn create(&self, pool_id: &str, config: PoolConfig) -> Result<Arc<dyn Pool>, PoolError> {
        let backend = config.pool_type;
        let unavailable = |reason: &str| PoolError::BackendUnavailable {
            pool_id: pool_id.to_string(),
            backend,
            reason: reason.to_string(),
        };

        let pool: Arc<dyn Pool> = match backend {
            BackendType::Direct => Arc::new(DirectPool::new(pool_id, config, Arc::clone(&self.runtime))),
            BackendType::Delegated => {
                let remote = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| unavailable("no remote manager configured"))?;
                Arc::new(DelegatedPool::new(pool_id, config, Arc::clone(remote))?)
            }
            BackendType::Cluster => {
                let cluster = self
                    .cluster
                    .as_ref()
                    .ok_or_else(|| unavailable("no cluster configured"))?;
                Arc::new(ClusterPool::new(pool_id, config, Arc::clone(cluster)))
            }
        };
        Ok(pool)
    }
}

//! Delegated-manager backend: a thin client over an independent remote manager.
//!
//! The remote side owns a fixed group of workers. Local state only mirrors
//! what the remote reports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ErrorClass, PoolError, RemoteError};
use crate::pool::{
    BackendType, ExecutionResult, HealthStatus, Pool, PoolConfig, PoolCore, PoolStatus,
    PoolSummary, ScaleAck, Task,
};

/// Worker group size of a remote manager deployment.
pub const DELEGATED_WORKER_COUNT: usize = 3;

/// Error body exchanged with a remote manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub class: ErrorClass,
    pub message: String,
    pub retryable: bool,
    pub pool_id: Option<String>,
}

impl From<&PoolError> for ErrorBody {
    fn from(err: &PoolError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            pool_id: err.pool_id().map(str::to_string),
        }
    }
}

/// Request/response contract of a remote manager.
#[async_trait]
pub trait RemoteManagerClient: Send + Sync {
    /// Spawn a pool on the remote side, returning its remote id.
    async fn spawn(&self, config: &PoolConfig) -> Result<String, RemoteError>;

    async fn execute(&self, remote_id: &str, task: &Task) -> Result<ExecutionResult, RemoteError>;

    async fn health(&self, remote_id: &str) -> Result<HealthStatus, RemoteError>;

    async fn close(&self, remote_id: &str) -> Result<(), RemoteError>;
}

/// JSON/HTTP client for a remote manager's pool surface.
pub struct HttpRemoteClient {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, RemoteError> {
        let resp = self.authorize(req).send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| RemoteError::InvalidResponse(e.to_string()));
        }
        Err(remote_failure(status, resp).await)
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

async fn remote_failure(status: reqwest::StatusCode, resp: reqwest::Response) -> RemoteError {
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => RemoteError::Remote {
            class: body.class,
            message: body.message,
            retryable: body.retryable,
        },
        Err(_) => RemoteError::InvalidResponse(format!("{status}: {text}")),
    }
}

#[async_trait]
impl RemoteManagerClient for HttpRemoteClient {
    async fn spawn(&self, config: &PoolConfig) -> Result<String, RemoteError> {
        let summary: PoolSummary = self
            .send(self.client.post(self.url("/api/pools")).json(config))
            .await?;
        Ok(summary.pool_id)
    }

    async fn execute(&self, remote_id: &str, task: &Task) -> Result<ExecutionResult, RemoteError> {
        self.send(
            self.client
                .post(self.url(&format!("/api/pools/{remote_id}/execute")))
                .json(task),
        )
        .await
    }

    async fn health(&self, remote_id: &str) -> Result<HealthStatus, RemoteError> {
        self.send(self.client.get(self.url(&format!("/api/pools/{remote_id}/health"))))
            .await
    }

    async fn close(&self, remote_id: &str) -> Result<(), RemoteError> {
        let req = self
            .client
            .delete(self.url(&format!("/api/pools/{remote_id}")));
        let resp = self.authorize(req).send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(remote_failure(status, resp).await)
    }
}

/// A pool forwarded to a remote manager.
pub struct DelegatedPool {
    core: PoolCore,
    client: Arc<dyn RemoteManagerClient>,
    remote_id: RwLock<Option<String>>,
}

impl DelegatedPool {
    /// Rejects configs that cannot hold the remote's fixed worker group.
    pub fn new(
        pool_id: impl Into<String>,
        config: PoolConfig,
        client: Arc<dyn RemoteManagerClient>,
    ) -> Result<Self, PoolError> {
        let pool_id = pool_id.into();
        if !(config.min_workers..=config.max_workers).contains(&DELEGATED_WORKER_COUNT) {
            return Err(PoolError::Configuration {
                pool_id: Some(pool_id),
                reason: format!(
                    "delegated pools run exactly {DELEGATED_WORKER_COUNT} workers; bounds {}..{} exclude it",
                    config.min_workers, config.max_workers
                ),
            });
        }
        Ok(Self {
            core: PoolCore::new(pool_id, config),
            client,
            remote_id: RwLock::new(None),
        })
    }

    /// Config sent to the remote side: a direct pool of the fixed size.
    fn remote_config(&self) -> PoolConfig {
        let config = self.core.config();
        let remote_type = config
            .setting_str("remote_pool_type")
            .and_then(|t| t.parse().ok())
            .unwrap_or(BackendType::Direct);
        let mut remote = config.clone();
        remote.pool_type = remote_type;
        remote.min_workers = DELEGATED_WORKER_COUNT;
        remote.max_workers = DELEGATED_WORKER_COUNT;
        remote
    }

    async fn remote_id(&self) -> Result<String, PoolError> {
        self.remote_id
            .read()
            .await
            .clone()
            .ok_or_else(|| PoolError::Unavailable {
                pool_id: self.core.pool_id().to_string(),
                status: PoolStatus::Spawning,
            })
    }

    fn map_remote(&self, err: RemoteError) -> PoolError {
        let pool_id = self.core.pool_id().to_string();
        match err {
            RemoteError::Transport(reason) => PoolError::Execution {
                pool_id,
                reason,
                retryable: true,
            },
            RemoteError::InvalidResponse(reason) => PoolError::Execution {
                pool_id,
                reason,
                retryable: false,
            },
            RemoteError::Remote {
                class,
                message,
                retryable,
            } => match class {
                ErrorClass::ExecutionTimeout => PoolError::Timeout {
                    pool_id,
                    timeout: self.core.config().timeout(),
                },
                ErrorClass::Configuration => PoolError::Configuration {
                    pool_id: Some(pool_id),
                    reason: message,
                },
                ErrorClass::BackendUnavailable => PoolError::BackendUnavailable {
                    pool_id,
                    backend: BackendType::Delegated,
                    reason: message,
                },
                ErrorClass::CapabilityNotSupported => PoolError::CapabilityNotSupported {
                    pool_id,
                    operation: message,
                },
                _ => PoolError::Execution {
                    pool_id,
                    reason: message,
                    retryable,
                },
            },
        }
    }

    fn timeout_error(&self) -> PoolError {
        PoolError::Timeout {
            pool_id: self.core.pool_id().to_string(),
            timeout: self.core.config().timeout(),
        }
    }
}

#[async_trait]
impl Pool for DelegatedPool {
    fn core(&self) -> &PoolCore {
        &self.core
    }

    async fn spawn(&self) -> Result<(), PoolError> {
        let deadline = self.core.config().timeout();
        let remote_config = self.remote_config();
        let spawned = tokio::time::timeout(deadline, self.client.spawn(&remote_config)).await;

        let reason = match spawned {
            Ok(Ok(remote_id)) => {
                tracing::info!(
                    pool_id = %self.core.pool_id(),
                    remote_id = %remote_id,
                    "Delegated pool spawned"
                );
                *self.remote_id.write().await = Some(remote_id);
                self.core.set_worker_count(DELEGATED_WORKER_COUNT).await;
                return self.core.transition(PoolStatus::Active, None).await;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("remote spawn timed out after {deadline:?}"),
        };

        self.core.finish_close().await;
        Err(PoolError::BackendUnavailable {
            pool_id: self.core.pool_id().to_string(),
            backend: BackendType::Delegated,
            reason,
        })
    }

    async fn execute(&self, task: Task) -> Result<ExecutionResult, PoolError> {
        self.core.ensure_accepting().await?;
        let _in_flight = self.core.begin_task();
        let remote_id = self.remote_id().await?;
        let deadline = self.core.config().timeout();
        let started = Instant::now();

        let mut result = match tokio::time::timeout(deadline, self.client.execute(&remote_id, &task)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = self.map_remote(e);
                self.core.record_error(err.to_string()).await;
                return Err(err);
            }
            Err(_) => return Err(self.timeout_error()),
        };

        // Results are attributed to the local pool so dedup keys stay local.
        result.pool_id = self.core.pool_id().to_string();
        if result.duration.is_zero() {
            result.duration = started.elapsed();
        }
        self.core.history().record(result.clone()).await;
        Ok(result)
    }

    async fn scale(&self, _target: usize) -> Result<ScaleAck, PoolError> {
        Err(PoolError::CapabilityNotSupported {
            pool_id: self.core.pool_id().to_string(),
            operation: "scale".into(),
        })
    }

    async fn close(&self) -> Result<(), PoolError> {
        if !self.core.begin_close().await {
            return Ok(());
        }
        if let Some(remote_id) = self.remote_id.read().await.clone() {
            let deadline = self.core.config().timeout();
            match tokio::time::timeout(deadline, self.client.close(&remote_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = self.map_remote(e);
                    self.core.record_error(err.to_string()).await;
                    return Err(err);
                }
                Err(_) => return Err(self.timeout_error()),
            }
        }
        self.core.finish_close().await;
        tracing::info!(pool_id = %self.core.pool_id(), "Delegated pool closed");
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let status = self.core.status().await;
        if status.is_shutting_down() {
            return self.core.local_health().await;
        }
        let Ok(remote_id) = self.remote_id().await else {
            return self.core.local_health().await;
        };

        let deadline = self.core.config().timeout();
        match tokio::time::timeout(deadline, self.client.health(&remote_id)).await {
            Ok(Ok(remote)) => {
                self.core.set_worker_count(remote.worker_count).await;
                if remote.status == PoolStatus::Degraded {
                    let reason = remote
                        .last_error
                        .unwrap_or_else(|| "remote reports degraded".into());
                    self.core.mark_degraded(reason).await;
                } else if remote.status.accepts_tasks() && status == PoolStatus::Degraded {
                    let _ = self.core.transition(PoolStatus::Active, None).await;
                    self.core.update(|s| s.last_error = None).await;
                }
            }
            Ok(Err(e)) => {
                self.core.mark_degraded(format!("remote health failed: {e}")).await;
            }
            Err(_) => {
                self.core
                    .mark_degraded(format!("remote health timed out after {deadline:?}"))
                    .await;
            }
        }
        self.core.local_health().await
    }
}

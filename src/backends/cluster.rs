//! Cluster-job backend: workers are scheduled as isolated job units.
//!
//! Spawn registers a job template, execute submits one job per task and polls
//! it to a terminal state, scale moves the template's autoscaling target.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::error::{ClusterError, PoolError};
use crate::pool::{
    BackendType, ExecutionResult, HealthStatus, Pool, PoolConfig, PoolCore, PoolStatus, ScaleAck,
    Task,
};
use crate::runtime::WorkerRuntime;

/// Default interval between job status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Job template registered for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    pub image: String,
    pub worker_type: String,
    pub min_replicas: usize,
    pub max_replicas: usize,
}

/// Observed state of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { worker_id: String, output: Value },
    Failed { worker_id: String, reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

/// Scheduler operations the cluster backend depends on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_template(&self, template: &JobTemplate) -> Result<(), ClusterError>;

    /// Submit one job running `task`; returns the job id.
    async fn submit_job(&self, template: &str, task: &Task) -> Result<String, ClusterError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ClusterError>;

    /// Stop a job that is no longer wanted and forget it.
    async fn cancel_job(&self, job_id: &str) -> Result<(), ClusterError>;

    async fn set_autoscale_target(&self, template: &str, replicas: usize) -> Result<(), ClusterError>;

    async fn ready_replicas(&self, template: &str) -> Result<usize, ClusterError>;

    async fn delete_template(&self, template: &str) -> Result<(), ClusterError>;
}

struct TemplateState {
    template: JobTemplate,
    target: usize,
}

struct JobRecord {
    status: JobStatus,
    abort: AbortHandle,
}

/// In-process scheduler that runs job units on a `WorkerRuntime`.
///
/// Replicas become ready as soon as the target is set. Terminal job records
/// are dropped once observed; cancelled jobs are aborted and dropped at once.
pub struct LocalCluster {
    runtime: Arc<dyn WorkerRuntime>,
    templates: Mutex<HashMap<String, TemplateState>>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
    max_templates: usize,
    next_job: AtomicU64,
}

impl LocalCluster {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self {
            runtime,
            templates: Mutex::new(HashMap::new()),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            max_templates: 64,
            next_job: AtomicU64::new(0),
        }
    }

    pub fn with_max_templates(mut self, max: usize) -> Self {
        self.max_templates = max;
        self
    }

    pub async fn template_count(&self) -> usize {
        self.templates.lock().await.len()
    }

    /// Job records not yet observed in a terminal state or cancelled.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

/// Update a job that is still recorded. Cancelled jobs stay forgotten.
async fn set_job_status(jobs: &Mutex<HashMap<String, JobRecord>>, job_id: &str, status: JobStatus) {
    if let Some(record) = jobs.lock().await.get_mut(job_id) {
        record.status = status;
    }
}

/// Image references must be non-empty, lowercase and whitespace-free.
fn validate_image(image: &str) -> Result<(), ClusterError> {
    if image.is_empty() || image.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
        return Err(ClusterError::ImagePull {
            image: image.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl ClusterApi for LocalCluster {
    async fn create_template(&self, template: &JobTemplate) -> Result<(), ClusterError> {
        if template.min_replicas > template.max_replicas {
            return Err(ClusterError::InvalidSpec(format!(
                "min_replicas {} > max_replicas {}",
                template.min_replicas, template.max_replicas
            )));
        }
        validate_image(&template.image)?;

        let mut templates = self.templates.lock().await;
        if !templates.contains_key(&template.name) && templates.len() >= self.max_templates {
            return Err(ClusterError::QuotaExceeded(format!(
                "template limit {} reached",
                self.max_templates
            )));
        }
        templates.insert(
            template.name.clone(),
            TemplateState {
                template: template.clone(),
                target: 0,
            },
        );
        Ok(())
    }

    async fn submit_job(&self, template: &str, task: &Task) -> Result<String, ClusterError> {
        let worker_type = {
            let templates = self.templates.lock().await;
            let state = templates
                .get(template)
                .ok_or_else(|| ClusterError::NotFound(template.to_string()))?;
            if state.target == 0 {
                return Err(ClusterError::Unavailable(format!(
                    "template {template} has no ready replicas"
                )));
            }
            state.template.worker_type.clone()
        };

        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("{template}-job-{n}");

        let runtime = Arc::clone(&self.runtime);
        let task = task.clone();
        let id = job_id.clone();
        // Held across the spawn so the job cannot report before it is recorded.
        let mut jobs = self.jobs.lock().await;
        let handle = tokio::spawn({
            let jobs = Arc::clone(&self.jobs);
            async move {
                set_job_status(&jobs, &id, JobStatus::Running).await;
                let outcome = match runtime.start_worker(&id, &worker_type).await {
                    Ok(()) => {
                        let out = runtime.run(&id, &task).await;
                        runtime.stop_worker(&id).await;
                        out
                    }
                    Err(e) => Err(e),
                };
                let status = match outcome {
                    Ok(output) => JobStatus::Succeeded {
                        worker_id: id.clone(),
                        output,
                    },
                    Err(e) => JobStatus::Failed {
                        worker_id: id.clone(),
                        reason: e.to_string(),
                    },
                };
                set_job_status(&jobs, &id, status).await;
            }
        });
        jobs.insert(
            job_id.clone(),
            JobRecord {
                status: JobStatus::Pending,
                abort: handle.abort_handle(),
            },
        );

        Ok(job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ClusterError> {
        let mut jobs = self.jobs.lock().await;
        let status = jobs
            .get(job_id)
            .map(|record| record.status.clone())
            .ok_or_else(|| ClusterError::NotFound(job_id.to_string()))?;
        if status.is_terminal() {
            jobs.remove(job_id);
        }
        Ok(status)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), ClusterError> {
        let record = self
            .jobs
            .lock()
            .await
            .remove(job_id)
            .ok_or_else(|| ClusterError::NotFound(job_id.to_string()))?;
        if !record.status.is_terminal() {
            record.abort.abort();
            self.runtime.stop_worker(job_id).await;
            tracing::debug!(job_id, "Job cancelled");
        }
        Ok(())
    }

    async fn set_autoscale_target(&self, template: &str, replicas: usize) -> Result<(), ClusterError> {
        let mut templates = self.templates.lock().await;
        let state = templates
            .get_mut(template)
            .ok_or_else(|| ClusterError::NotFound(template.to_string()))?;
        state.target = replicas.clamp(state.template.min_replicas, state.template.max_replicas);
        Ok(())
    }

    async fn ready_replicas(&self, template: &str) -> Result<usize, ClusterError> {
        self.templates
            .lock()
            .await
            .get(template)
            .map(|s| s.target)
            .ok_or_else(|| ClusterError::NotFound(template.to_string()))
    }

    async fn delete_template(&self, template: &str) -> Result<(), ClusterError> {
        self.templates
            .lock()
            .await
            .remove(template)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(template.to_string()))
    }
}

/// A pool backed by a cluster job template.
pub struct ClusterPool {
    core: PoolCore,
    cluster: Arc<dyn ClusterApi>,
    template: JobTemplate,
    poll_interval: Duration,
}

impl ClusterPool {
    pub fn new(pool_id: impl Into<String>, config: PoolConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        let pool_id = pool_id.into();
        let template = JobTemplate {
            name: pool_id.clone(),
            image: config
                .setting_str("image")
                .unwrap_or(config.worker_type.as_str())
                .to_string(),
            worker_type: config.worker_type.clone(),
            min_replicas: config.min_workers,
            max_replicas: config.max_workers,
        };
        let poll_interval = config
            .setting_u64("poll_interval_ms")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self {
            core: PoolCore::new(pool_id, config),
            cluster,
            template,
            poll_interval,
        }
    }

    /// Transient errors are retryable execution failures; terminal ones are
    /// configuration problems with the pool.
    fn map_cluster(&self, err: ClusterError) -> PoolError {
        let pool_id = self.core.pool_id().to_string();
        if err.is_transient() {
            return PoolError::Execution {
                pool_id,
                reason: err.to_string(),
                retryable: true,
            };
        }
        match err {
            ClusterError::NotFound(_) => PoolError::Execution {
                pool_id,
                reason: err.to_string(),
                retryable: false,
            },
            _ => PoolError::Configuration {
                pool_id: Some(pool_id),
                reason: err.to_string(),
            },
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, PoolError> {
        let deadline = self.core.config().timeout();
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(self.map_cluster(e)),
            Err(_) => Err(PoolError::Timeout {
                pool_id: self.core.pool_id().to_string(),
                timeout: deadline,
            }),
        }
    }

    /// Submit and poll to a terminal state within the pool deadline. A job
    /// that misses the deadline or cannot be polled is cancelled.
    async fn run_job(&self, task: &Task) -> Result<JobStatus, PoolError> {
        let deadline = self.core.config().timeout();
        let started = Instant::now();
        let job_id = self
            .bounded(self.cluster.submit_job(&self.template.name, task))
            .await?;
        tracing::debug!(pool_id = %self.core.pool_id(), job_id = %job_id, "Job submitted");

        let remaining = deadline.saturating_sub(started.elapsed());
        let err = match tokio::time::timeout(remaining, self.poll_job(&job_id)).await {
            Ok(Ok(status)) => return Ok(status),
            Ok(Err(e)) => self.map_cluster(e),
            Err(_) => PoolError::Timeout {
                pool_id: self.core.pool_id().to_string(),
                timeout: deadline,
            },
        };
        self.cancel_job(&job_id).await;
        Err(err)
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, ClusterError> {
        loop {
            let status = self.cluster.job_status(job_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cancel_job(&self, job_id: &str) {
        match self.bounded(self.cluster.cancel_job(job_id)).await {
            Ok(()) => {}
            // Already terminal and collected.
            Err(PoolError::Execution { retryable: false, .. }) => {}
            Err(e) => {
                tracing::warn!(pool_id = %self.core.pool_id(), job_id, error = %e, "Failed to cancel job");
            }
        }
    }

    /// Remove a template whose pool never came up. Best effort.
    async fn discard_template(&self) {
        if let Err(e) = self
            .bounded(self.cluster.delete_template(&self.template.name))
            .await
        {
            tracing::warn!(pool_id = %self.core.pool_id(), error = %e, "Failed to remove template after spawn failure");
        }
    }

    /// Terminal cluster errors stay configuration errors; anything else means
    /// the cluster could not host the pool.
    fn spawn_error(&self, err: PoolError) -> PoolError {
        match err {
            PoolError::Configuration { .. } => err,
            other => PoolError::BackendUnavailable {
                pool_id: self.core.pool_id().to_string(),
                backend: BackendType::Cluster,
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl Pool for ClusterPool {
    fn core(&self) -> &PoolCore {
        &self.core
    }

    async fn spawn(&self) -> Result<(), PoolError> {
        let min = self.core.config().min_workers;
        if let Err(e) = self
            .bounded(self.cluster.create_template(&self.template))
            .await
        {
            self.core.finish_close().await;
            return Err(self.spawn_error(e));
        }

        let replicas = async {
            self.cluster
                .set_autoscale_target(&self.template.name, min)
                .await?;
            self.cluster.ready_replicas(&self.template.name).await
        };
        let ready = match self.bounded(replicas).await {
            Ok(0) => Err(PoolError::BackendUnavailable {
                pool_id: self.core.pool_id().to_string(),
                backend: BackendType::Cluster,
                reason: "no replicas became ready".into(),
            }),
            Ok(ready) => Ok(ready),
            Err(e) => Err(self.spawn_error(e)),
        };
        // From here on the template exists; a failed spawn must not leak it.
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                self.discard_template().await;
                self.core.finish_close().await;
                return Err(e);
            }
        };

        self.core.set_worker_count(ready).await;
        if ready < min {
            self.core.transition(PoolStatus::Degraded, None).await?;
            self.core
                .record_error(format!("{ready}/{min} replicas ready"))
                .await;
        } else {
            self.core.transition(PoolStatus::Active, None).await?;
        }
        tracing::info!(pool_id = %self.core.pool_id(), replicas = ready, image = %self.template.image, "Cluster pool spawned");
        Ok(())
    }

    async fn execute(&self, task: Task) -> Result<ExecutionResult, PoolError> {
        self.core.ensure_accepting().await?;
        let _in_flight = self.core.begin_task();
        let started = Instant::now();
        let pool_id = self.core.pool_id().to_string();

        let status = match self.run_job(&task).await {
            Ok(status) => status,
            Err(e) => {
                self.core.record_error(e.to_string()).await;
                return Err(e);
            }
        };

        match status {
            JobStatus::Succeeded { worker_id, output } => {
                let result = ExecutionResult::succeeded(&pool_id, worker_id, task, output, started.elapsed());
                self.core.history().record(result.clone()).await;
                Ok(result)
            }
            JobStatus::Failed { worker_id, reason } => {
                let result = ExecutionResult::failed(&pool_id, worker_id, task, &reason, started.elapsed());
                self.core.history().record(result).await;
                self.core.record_error(reason.clone()).await;
                Err(PoolError::Execution {
                    pool_id,
                    reason,
                    retryable: false,
                })
            }
            JobStatus::Pending | JobStatus::Running => Err(PoolError::Execution {
                pool_id,
                reason: "job left in a non-terminal state".into(),
                retryable: true,
            }),
        }
    }

    async fn scale(&self, target: usize) -> Result<ScaleAck, PoolError> {
        self.core.ensure_accepting().await?;
        let target = self.core.config().clamp_workers(target);
        let previous = self.core.worker_count().await;

        self.core.transition(PoolStatus::Scaling, None).await?;
        let scaled = async {
            self.cluster
                .set_autoscale_target(&self.template.name, target)
                .await?;
            self.cluster.ready_replicas(&self.template.name).await
        };
        let current = match self.bounded(scaled).await {
            Ok(ready) => ready,
            Err(e) => {
                self.core.mark_degraded(e.to_string()).await;
                return Err(e);
            }
        };

        self.core.set_worker_count(current).await;
        let settled = if current < self.core.config().min_workers {
            PoolStatus::Degraded
        } else {
            PoolStatus::Active
        };
        self.core.transition(settled, None).await?;
        tracing::info!(pool_id = %self.core.pool_id(), previous, current, "Cluster pool scaled");
        Ok(ScaleAck {
            pool_id: self.core.pool_id().to_string(),
            previous,
            current,
        })
    }

    async fn close(&self) -> Result<(), PoolError> {
        if !self.core.begin_close().await {
            return Ok(());
        }
        let deadline = self.core.config().timeout();
        match tokio::time::timeout(deadline, self.cluster.delete_template(&self.template.name)).await {
            Ok(Ok(())) | Ok(Err(ClusterError::NotFound(_))) => {}
            Ok(Err(e)) => return Err(self.map_cluster(e)),
            Err(_) => {
                return Err(PoolError::Timeout {
                    pool_id: self.core.pool_id().to_string(),
                    timeout: deadline,
                });
            }
        }
        self.core.finish_close().await;
        tracing::info!(pool_id = %self.core.pool_id(), "Cluster pool closed");
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let status = self.core.status().await;
        if status.is_shutting_down() || status == PoolStatus::Spawning {
            return self.core.local_health().await;
        }

        match self.bounded(self.cluster.ready_replicas(&self.template.name)).await {
            Ok(ready) => {
                self.core.set_worker_count(ready).await;
                let min = self.core.config().min_workers;
                if ready < min {
                    self.core.mark_degraded(format!("{ready}/{min} replicas ready")).await;
                } else if status == PoolStatus::Degraded {
                    let _ = self.core.transition(PoolStatus::Active, None).await;
                    self.core.update(|s| s.last_error = None).await;
                }
            }
            Err(e) => self.core.mark_degraded(e.to_string()).await,
        }
        self.core.local_health().await
    }
}

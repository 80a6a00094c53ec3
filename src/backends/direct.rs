//! Direct-process backend: workers run on a local `WorkerRuntime`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PoolError;
use crate::pool::{
    BackendType, ExecutionResult, HealthStatus, Pool, PoolConfig, PoolCore, PoolStatus, ScaleAck,
    Task,
};
use crate::runtime::WorkerRuntime;

/// A pool whose workers are slots on a local runtime.
///
/// Idle workers sit in a FIFO queue; the semaphore holds one permit per idle
/// worker, so acquiring a permit guarantees a worker can be popped.
pub struct DirectPool {
    core: PoolCore,
    runtime: Arc<dyn WorkerRuntime>,
    idle: Arc<StdMutex<VecDeque<String>>>,
    permits: Arc<Semaphore>,
    next_worker: AtomicUsize,
}

/// A checked-out worker. Returns itself to the idle queue on drop, or stops
/// itself if the pool closed while it was out.
struct WorkerLease {
    worker_id: String,
    idle: Arc<StdMutex<VecDeque<String>>>,
    permits: Arc<Semaphore>,
    runtime: Arc<dyn WorkerRuntime>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let worker_id = std::mem::take(&mut self.worker_id);
        // Checked under the idle lock; close() closes the semaphore under it too.
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if !self.permits.is_closed() {
            idle.push_back(worker_id);
            return;
        }
        drop(idle);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = Arc::clone(&self.runtime);
                handle.spawn(async move {
                    runtime.stop_worker(&worker_id).await;
                    tracing::debug!(worker_id = %worker_id, "Worker stopped after pool close");
                });
            }
            Err(_) => tracing::warn!(worker_id = %worker_id, "No runtime to stop worker returned after close"),
        }
    }
}

impl DirectPool {
    pub fn new(pool_id: impl Into<String>, config: PoolConfig, runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self {
            core: PoolCore::new(pool_id, config),
            runtime,
            idle: Arc::new(StdMutex::new(VecDeque::new())),
            permits: Arc::new(Semaphore::new(0)),
            next_worker: AtomicUsize::new(0),
        }
    }

    fn next_worker_id(&self) -> String {
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-w{n}", self.core.pool_id())
    }

    /// Start `count` workers, returning how many came up and the last failure.
    async fn start_workers(&self, count: usize) -> (usize, Option<String>) {
        let worker_type = self.core.config().worker_type.clone();
        let mut started = 0;
        let mut last_error = None;
        for _ in 0..count {
            let worker_id = self.next_worker_id();
            match self.runtime.start_worker(&worker_id, &worker_type).await {
                Ok(()) => {
                    self.idle
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(worker_id);
                    self.permits.add_permits(1);
                    started += 1;
                }
                Err(e) => {
                    tracing::warn!(pool_id = %self.core.pool_id(), error = %e, "Worker failed to start");
                    last_error = Some(e.to_string());
                }
            }
        }
        (started, last_error)
    }

    /// Retire up to `count` idle workers. Busy workers are left alone.
    async fn retire_idle(&self, count: usize) -> usize {
        let mut retired = Vec::new();
        for _ in 0..count {
            let Ok(permit) = self.permits.try_acquire() else {
                break;
            };
            let worker = self
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match worker {
                Some(worker_id) => {
                    permit.forget();
                    retired.push(worker_id);
                }
                None => break,
            }
        }
        for worker_id in &retired {
            self.runtime.stop_worker(worker_id).await;
        }
        retired.len()
    }

    async fn checkout(&self) -> Result<WorkerLease, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Unavailable {
                pool_id: self.core.pool_id().to_string(),
                status: PoolStatus::Closing,
            })?;
        let worker_id = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| PoolError::Execution {
                pool_id: self.core.pool_id().to_string(),
                reason: "worker queue out of sync with permits".into(),
                retryable: true,
            })?;
        Ok(WorkerLease {
            worker_id,
            idle: Arc::clone(&self.idle),
            permits: Arc::clone(&self.permits),
            runtime: Arc::clone(&self.runtime),
            _permit: permit,
        })
    }
}

#[async_trait]
impl Pool for DirectPool {
    fn core(&self) -> &PoolCore {
        &self.core
    }

    async fn spawn(&self) -> Result<(), PoolError> {
        let config = self.core.config();
        let (started, last_error) = self.start_workers(config.min_workers).await;
        self.core.set_worker_count(started).await;

        if started == 0 {
            self.core.finish_close().await;
            return Err(PoolError::BackendUnavailable {
                pool_id: self.core.pool_id().to_string(),
                backend: BackendType::Direct,
                reason: last_error.unwrap_or_else(|| "no workers started".into()),
            });
        }

        if started < config.min_workers {
            self.core
                .transition(PoolStatus::Degraded, last_error.clone())
                .await?;
            self.core
                .record_error(format!(
                    "{started}/{} workers started: {}",
                    config.min_workers,
                    last_error.unwrap_or_default()
                ))
                .await;
        } else {
            self.core.transition(PoolStatus::Active, None).await?;
        }

        tracing::info!(pool_id = %self.core.pool_id(), workers = started, "Direct pool spawned");
        Ok(())
    }

    async fn execute(&self, task: Task) -> Result<ExecutionResult, PoolError> {
        self.core.ensure_accepting().await?;
        let _in_flight = self.core.begin_task();
        let pool_id = self.core.pool_id().to_string();
        let deadline = self.core.config().timeout();
        let started = Instant::now();

        let outcome = tokio::time::timeout(deadline, async {
            let lease = self.checkout().await?;
            let output = self.runtime.run(&lease.worker_id, &task).await;
            Ok::<_, PoolError>((lease.worker_id.clone(), output))
        })
        .await;

        let (worker_id, output) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(pool_id = %pool_id, timeout = ?deadline, "Direct execution timed out");
                return Err(PoolError::Timeout {
                    pool_id,
                    timeout: deadline,
                });
            }
        };

        match output {
            Ok(value) => {
                let result = ExecutionResult::succeeded(&pool_id, worker_id, task, value, started.elapsed());
                self.core.history().record(result.clone()).await;
                tracing::debug!(pool_id = %pool_id, worker_id = %result.worker_id, "Task completed");
                Ok(result)
            }
            Err(e) => {
                let reason = e.to_string();
                let result = ExecutionResult::failed(&pool_id, worker_id, task, &reason, started.elapsed());
                self.core.history().record(result).await;
                self.core.record_error(reason.clone()).await;
                Err(PoolError::Execution {
                    pool_id,
                    reason,
                    retryable: e.is_retryable(),
                })
            }
        }
    }

    async fn scale(&self, target: usize) -> Result<ScaleAck, PoolError> {
        let status = self.core.status().await;
        if !status.accepts_tasks() {
            return Err(PoolError::Unavailable {
                pool_id: self.core.pool_id().to_string(),
                status,
            });
        }

        let target = self.core.config().clamp_workers(target);
        let previous = self.core.worker_count().await;
        if target == previous {
            return Ok(ScaleAck {
                pool_id: self.core.pool_id().to_string(),
                previous,
                current: previous,
            });
        }

        self.core.transition(PoolStatus::Scaling, None).await?;
        let current = if target > previous {
            let (started, last_error) = self.start_workers(target - previous).await;
            if let Some(err) = last_error {
                self.core.record_error(err).await;
            }
            previous + started
        } else {
            previous - self.retire_idle(previous - target).await
        };
        self.core.set_worker_count(current).await;

        let settled = if current < self.core.config().min_workers {
            PoolStatus::Degraded
        } else {
            PoolStatus::Active
        };
        self.core.transition(settled, None).await?;

        tracing::info!(pool_id = %self.core.pool_id(), previous, current, target, "Direct pool scaled");
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
        // Leased workers stop themselves when they come back.
        let workers: Vec<String> = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            self.permits.close();
            idle.drain(..).collect()
        };
        for worker_id in &workers {
            self.runtime.stop_worker(worker_id).await;
        }
        self.core.finish_close().await;
        tracing::info!(pool_id = %self.core.pool_id(), stopped = workers.len(), "Direct pool closed");
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        self.core.local_health().await
    }
}

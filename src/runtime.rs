//! Worker runtime contract and the subprocess reference runtime.
//!
//! A runtime is opaque: task in, JSON result or error out. Deadlines are
//! enforced by the calling backend, not by the runtime.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::RuntimeError;
use crate::pool::Task;

/// Maximum captured output before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Executes tasks on named workers.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Bring a worker up.
    async fn start_worker(&self, worker_id: &str, worker_type: &str) -> Result<(), RuntimeError>;

    /// Run one task on a started worker.
    async fn run(&self, worker_id: &str, task: &Task) -> Result<Value, RuntimeError>;

    /// Tear a worker down. Best effort.
    async fn stop_worker(&self, worker_id: &str);
}

/// Runs a program per task: task JSON on stdin, JSON (or text) on stdout.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    program: String,
    args: Vec<String>,
    /// Hard ceiling per process, independent of the pool deadline.
    kill_after: Duration,
}

impl CommandRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            kill_after: Duration::from_secs(600),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = kill_after;
        self
    }

    /// Build from a shell-style command line (`"python3 worker.py --json"`).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts.collect()))
    }

    async fn run_process(&self, worker_id: &str, input: Vec<u8>) -> Result<Value, RuntimeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("POOL_WORKER_ID", worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Crashed {
                worker_id: worker_id.to_string(),
                reason: format!("failed to spawn {}: {e}", self.program),
            })?;

        let mut stdin_pipe = child.stdin.take();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let result = tokio::time::timeout(self.kill_after, async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            // Feed stdin while draining both outputs: a worker that echoes as it
            // reads blocks on a full stdout otherwise.
            let (written, out, err) = tokio::join!(
                async {
                    let Some(mut stdin) = stdin_pipe.take() else {
                        return Ok(());
                    };
                    // Dropping stdin afterwards closes it so the worker sees EOF.
                    match stdin.write_all(&input).await {
                        // A worker that ignores stdin may exit before reading it.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                        Err(e) => Err(std::io::Error::new(
                            e.kind(),
                            format!("failed to write task: {e}"),
                        )),
                        Ok(()) => Ok(()),
                    }
                },
                async {
                    match stdout_pipe.as_mut() {
                        Some(pipe) => pipe.read_to_end(&mut stdout).await.map(|_| ()),
                        None => Ok(()),
                    }
                },
                async {
                    match stderr_pipe.as_mut() {
                        Some(pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
                        None => Ok(()),
                    }
                },
            );
            written?;
            out?;
            err?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(RuntimeError::Crashed {
                    worker_id: worker_id.to_string(),
                    reason: format!("io error: {e}"),
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(RuntimeError::Crashed {
                    worker_id: worker_id.to_string(),
                    reason: format!("killed after {:?}", self.kill_after),
                });
            }
        };

        if !status.success() {
            let stderr = truncate_output(&String::from_utf8_lossy(&stderr));
            return Err(RuntimeError::TaskFailed {
                worker_id: worker_id.to_string(),
                reason: format!("exit code {}: {}", status.code().unwrap_or(-1), stderr.trim()),
            });
        }

        Ok(parse_output(&String::from_utf8_lossy(&stdout)))
    }
}

#[async_trait]
impl WorkerRuntime for CommandRuntime {
    async fn start_worker(&self, worker_id: &str, worker_type: &str) -> Result<(), RuntimeError> {
        if self.program.trim().is_empty() {
            return Err(RuntimeError::StartFailed {
                worker_id: worker_id.to_string(),
                reason: "no worker program configured".into(),
            });
        }
        tracing::debug!(worker_id, worker_type, program = %self.program, "Worker ready");
        Ok(())
    }

    async fn run(&self, worker_id: &str, task: &Task) -> Result<Value, RuntimeError> {
        let input = serde_json::to_vec(&task.to_json()).map_err(|e| RuntimeError::TaskFailed {
            worker_id: worker_id.to_string(),
            reason: format!("task not serialisable: {e}"),
        })?;
        self.run_process(worker_id, input).await
    }

    async fn stop_worker(&self, worker_id: &str) {
        tracing::debug!(worker_id, "Worker stopped");
    }
}

/// Parse stdout as JSON, falling back to a trimmed string.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(truncate_output(trimmed)))
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}

//! Pool data model: configuration, tasks, results, health.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PoolError;
use crate::pool::state::PoolStatus;

/// Default per-call deadline when a pool config doesn't set `timeout_ms`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which execution substrate backs a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Workers run in the local runtime.
    Direct,
    /// Calls are forwarded to an independent remote manager.
    Delegated,
    /// Workers are scheduled as cluster job units.
    Cluster,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Delegated => "delegated",
            Self::Cluster => "cluster",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "delegated" => Ok(Self::Delegated),
            "cluster" => Ok(Self::Cluster),
            other => Err(format!("unknown pool type: {other}")),
        }
    }
}

/// Immutable pool configuration supplied at spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub pool_type: BackendType,
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_type: String,
    /// Opaque per-backend settings.
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl PoolConfig {
    pub fn new(
        name: impl Into<String>,
        pool_type: BackendType,
        worker_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pool_type,
            min_workers: 1,
            max_workers: 1,
            worker_type: worker_type.into(),
            settings: Map::new(),
        }
    }

    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_setting("timeout_ms", timeout.as_millis() as u64)
    }

    /// Validate bounds and worker type.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::config("name must not be empty"));
        }
        if self.min_workers == 0 || self.max_workers == 0 {
            return Err(PoolError::config(format!(
                "min_workers and max_workers must be > 0 (got {}..{})",
                self.min_workers, self.max_workers
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.worker_type.trim().is_empty() {
            return Err(PoolError::config("worker_type must not be empty"));
        }
        Ok(())
    }

    /// Clamp a requested worker count into [min_workers, max_workers].
    pub fn clamp_workers(&self, target: usize) -> usize {
        target.clamp(self.min_workers, self.max_workers)
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_strings(&self, key: &str) -> Vec<String> {
        self.settings
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deadline applied to every backend call for this pool.
    pub fn timeout(&self) -> Duration {
        self.setting_u64("timeout_ms")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Opaque key/value task payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Task {
    pub payload: Map<String, Value>,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Shorthand for a task carrying a single prompt.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new().with("prompt", text.into())
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

/// Outcome of one task execution on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub pool_id: String,
    pub worker_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    pub task: Task,
}

impl ExecutionResult {
    pub fn succeeded(
        pool_id: impl Into<String>,
        worker_id: impl Into<String>,
        task: Task,
        output: Value,
        duration: Duration,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            worker_id: worker_id.into(),
            success: true,
            output: Some(output),
            error: None,
            duration,
            completed_at: Utc::now(),
            task,
        }
    }

    pub fn failed(
        pool_id: impl Into<String>,
        worker_id: impl Into<String>,
        task: Task,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            worker_id: worker_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
            completed_at: Utc::now(),
            task,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            pool_id: self.pool_id.clone(),
            worker_id: self.worker_id.clone(),
            completed_at: self.completed_at,
        }
    }

    /// Flattened text used for relevance scoring.
    pub fn searchable_text(&self) -> String {
        let mut parts = Vec::new();
        for value in self.task.payload.values() {
            push_text(value, &mut parts);
        }
        if let Some(output) = &self.output {
            push_text(output, &mut parts);
        }
        if let Some(error) = &self.error {
            parts.push(error.clone());
        }
        parts.join(" ")
    }
}

fn push_text(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::String(s) => parts.push(s.clone()),
        Value::Null => {}
        Value::Array(items) => items.iter().for_each(|v| push_text(v, parts)),
        Value::Object(map) => map.values().for_each(|v| push_text(v, parts)),
        other => parts.push(other.to_string()),
    }
}

/// Idempotency key for sync: (pool_id, worker_id, completion timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub pool_id: String,
    pub worker_id: String,
    pub completed_at: DateTime<Utc>,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nanos = self
            .completed_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.completed_at.timestamp_micros() * 1000);
        write!(f, "{}:{}:{}", self.pool_id, self.worker_id, nanos)
    }
}

/// Point-in-time health of a pool. Never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub pool_id: String,
    pub status: PoolStatus,
    pub worker_count: usize,
    pub in_flight: usize,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Health for a pool that could not be probed.
    pub fn unknown(pool_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            status: PoolStatus::Degraded,
            worker_count: 0,
            in_flight: 0,
            last_error: Some(reason.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == PoolStatus::Active && self.last_error.is_none()
    }
}

/// Listing entry for `list_pools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub pool_id: String,
    pub name: String,
    pub backend_type: BackendType,
    pub status: PoolStatus,
    pub worker_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Acknowledgement of a scale request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleAck {
    pub pool_id: String,
    pub previous: usize,
    pub current: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig::new("coders", BackendType::Direct, "claude").with_workers(1, 4)
    }

    #[test]
    fn validate_accepts_good_config() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_bounds() {
        let err = config().with_workers(0, 3).validate().unwrap_err();
        assert!(matches!(err, PoolError::Configuration { .. }));

        let err = config().with_workers(5, 2).validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn validate_rejects_empty_worker_type() {
        let mut cfg = config();
        cfg.worker_type = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn clamp_workers_respects_bounds() {
        let cfg = config();
        assert_eq!(cfg.clamp_workers(0), 1);
        assert_eq!(cfg.clamp_workers(3), 3);
        assert_eq!(cfg.clamp_workers(99), 4);
    }

    #[test]
    fn timeout_setting() {
        assert_eq!(config().timeout(), DEFAULT_TIMEOUT);
        let cfg = config().with_timeout(Duration::from_millis(250));
        assert_eq!(cfg.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn setting_strings_reads_arrays() {
        let cfg = config().with_setting("args", serde_json::json!(["-c", "cat"]));
        assert_eq!(cfg.setting_strings("args"), vec!["-c", "cat"]);
        assert!(cfg.setting_strings("missing").is_empty());
    }

    #[test]
    fn backend_type_parse() {
        assert_eq!("Cluster".parse::<BackendType>().unwrap(), BackendType::Cluster);
        assert!("k8s".parse::<BackendType>().is_err());
        assert_eq!(BackendType::Delegated.to_string(), "delegated");
    }

    #[test]
    fn task_is_transparent_map() {
        let task = Task::prompt("summarise the diff").with("priority", 2);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["prompt"], "summarise the diff");
        assert_eq!(json["priority"], 2);
    }

    #[test]
    fn dedup_key_is_stable() {
        let result = ExecutionResult::succeeded(
            "pool-a",
            "w-1",
            Task::prompt("x"),
            serde_json::json!("ok"),
            Duration::from_millis(5),
        );
        let a = result.dedup_key();
        let b = result.clone().dedup_key();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
        assert!(a.to_string().starts_with("pool-a:w-1:"));
    }

    #[test]
    fn searchable_text_flattens_task_and_output() {
        let result = ExecutionResult::succeeded(
            "pool-a",
            "w-1",
            Task::prompt("refactor parser").with("files", serde_json::json!(["lexer.rs"])),
            serde_json::json!({"summary": "split tokenizer"}),
            Duration::ZERO,
        );
        let text = result.searchable_text();
        assert!(text.contains("refactor parser"));
        assert!(text.contains("lexer.rs"));
        assert!(text.contains("split tokenizer"));
    }
}

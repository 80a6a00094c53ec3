//! Error types for the pool orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::{BackendType, PoolStatus};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Environment / process configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Closed classification of pool errors, used in summaries and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    PoolNotFound,
    PoolUnavailable,
    BackendUnavailable,
    ExecutionTimeout,
    Execution,
    NoAvailablePool,
    CapabilityNotSupported,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::PoolNotFound => "pool_not_found",
            Self::PoolUnavailable => "pool_unavailable",
            Self::BackendUnavailable => "backend_unavailable",
            Self::ExecutionTimeout => "execution_timeout",
            Self::Execution => "execution",
            Self::NoAvailablePool => "no_available_pool",
            Self::CapabilityNotSupported => "capability_not_supported",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by pool lifecycle and execution operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid configuration{}: {reason}", fmt_pool(.pool_id))]
    Configuration {
        pool_id: Option<String>,
        reason: String,
    },

    #[error("Pool {pool_id} not found")]
    NotFound { pool_id: String },

    #[error("Pool {pool_id} is {status} and cannot accept this operation")]
    Unavailable { pool_id: String, status: PoolStatus },

    #[error("{backend} backend unavailable for pool {pool_id}: {reason}")]
    BackendUnavailable {
        pool_id: String,
        backend: BackendType,
        reason: String,
    },

    #[error("Pool {pool_id} timed out after {timeout:?}")]
    Timeout { pool_id: String, timeout: Duration },

    #[error("Execution failed on pool {pool_id}: {reason}")]
    Execution {
        pool_id: String,
        reason: String,
        retryable: bool,
    },

    #[error("No available pool to route to")]
    NoAvailablePool,

    #[error("Pool {pool_id} does not support {operation}")]
    CapabilityNotSupported { pool_id: String, operation: String },
}

fn fmt_pool(pool_id: &Option<String>) -> String {
    pool_id
        .as_ref()
        .map(|id| format!(" for pool {id}"))
        .unwrap_or_default()
}

impl PoolError {
    /// Shorthand for a configuration error not yet tied to a pool.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            pool_id: None,
            reason: reason.into(),
        }
    }

    /// The failing pool, when the error concerns one.
    pub fn pool_id(&self) -> Option<&str> {
        match self {
            Self::Configuration { pool_id, .. } => pool_id.as_deref(),
            Self::NotFound { pool_id }
            | Self::Unavailable { pool_id, .. }
            | Self::BackendUnavailable { pool_id, .. }
            | Self::Timeout { pool_id, .. }
            | Self::Execution { pool_id, .. }
            | Self::CapabilityNotSupported { pool_id, .. } => Some(pool_id),
            Self::NoAvailablePool => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration { .. } => ErrorClass::Configuration,
            Self::NotFound { .. } => ErrorClass::PoolNotFound,
            Self::Unavailable { .. } => ErrorClass::PoolUnavailable,
            Self::BackendUnavailable { .. } => ErrorClass::BackendUnavailable,
            Self::Timeout { .. } => ErrorClass::ExecutionTimeout,
            Self::Execution { .. } => ErrorClass::Execution,
            Self::NoAvailablePool => ErrorClass::NoAvailablePool,
            Self::CapabilityNotSupported { .. } => ErrorClass::CapabilityNotSupported,
        }
    }

    /// Whether a caller-level retry policy may try again.
    ///
    /// Timeouts are retryable; configuration errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::BackendUnavailable { .. } | Self::NoAvailablePool => true,
            _ => false,
        }
    }

    /// Attach a pool id to a configuration error produced before the id existed.
    pub fn with_pool_id(self, id: &str) -> Self {
        match self {
            Self::Configuration {
                pool_id: None,
                reason,
            } => Self::Configuration {
                pool_id: Some(id.to_string()),
                reason,
            },
            other => other,
        }
    }
}

/// Worker runtime failures (opaque task-in/result-out contract).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Worker {worker_id} failed to start: {reason}")]
    StartFailed { worker_id: String, reason: String },

    #[error("Task failed on worker {worker_id}: {reason}")]
    TaskFailed { worker_id: String, reason: String },

    #[error("Worker {worker_id} crashed: {reason}")]
    Crashed { worker_id: String, reason: String },
}

impl RuntimeError {
    /// A crashed worker may succeed on retry; a task that failed on its own merits won't.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Crashed { .. })
    }
}

/// Delegated remote manager client errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote manager unreachable: {0}")]
    Transport(String),

    #[error("Remote manager returned {class}: {message}")]
    Remote {
        class: ErrorClass,
        message: String,
        retryable: bool,
    },

    #[error("Invalid response from remote manager: {0}")]
    InvalidResponse(String),
}

/// Cluster scheduler API errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("Cluster API rate limited")]
    RateLimited,

    #[error("Cluster API timed out: {0}")]
    Timeout(String),

    #[error("Cluster API unavailable: {0}")]
    Unavailable(String),

    #[error("Image {image} could not be pulled")]
    ImagePull { image: String },

    #[error("Cluster quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Cluster object {0} not found")]
    NotFound(String),
}

impl ClusterError {
    /// Transient errors are worth retrying; the rest are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// External durable/search store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Store migration failed: {0}")]
    Migration(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Store misconfigured: {0}")]
    Misconfigured(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Fatal errors stop the periodic sync loop; everything else waits for the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Misconfigured(_) | Self::Migration(_))
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_and_pool_id() {
        let err = PoolError::Execution {
            pool_id: "p1".into(),
            reason: "boom".into(),
            retryable: true,
        };
        assert_eq!(err.class(), ErrorClass::Execution);
        assert_eq!(err.pool_id(), Some("p1"));
        assert!(err.is_retryable());

        assert_eq!(PoolError::NoAvailablePool.pool_id(), None);
        assert!(!PoolError::config("bad").is_retryable());
    }

    #[test]
    fn timeout_distinguishable_from_failure() {
        let timeout = PoolError::Timeout {
            pool_id: "p1".into(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(timeout.class(), ErrorClass::ExecutionTimeout);
        assert!(timeout.to_string().contains("timed out"));
    }

    #[test]
    fn configuration_message_includes_pool_when_known() {
        let err = PoolError::config("min_workers must be > 0");
        assert_eq!(err.to_string(), "Invalid configuration: min_workers must be > 0");
        let err = err.with_pool_id("pool-a");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for pool pool-a: min_workers must be > 0"
        );
    }

    #[test]
    fn cluster_error_classification() {
        assert!(ClusterError::RateLimited.is_transient());
        assert!(ClusterError::Timeout("x".into()).is_transient());
        assert!(!ClusterError::ImagePull { image: "bad".into() }.is_transient());
        assert!(!ClusterError::QuotaExceeded("pods".into()).is_transient());
    }

    #[test]
    fn error_class_serde() {
        let json = serde_json::to_string(&ErrorClass::CapabilityNotSupported).unwrap();
        assert_eq!(json, "\"capability_not_supported\"");
        assert_eq!(ErrorClass::ExecutionTimeout.to_string(), "execution_timeout");
    }

    #[test]
    fn umbrella_wraps_subsystem_errors() {
        let err: Error = StoreError::Misconfigured("no schema".into()).into();
        assert!(matches!(err, Error::Store(ref e) if e.is_fatal()));
        assert!(err.to_string().starts_with("Store error:"));

        let err: Error = PoolError::NoAvailablePool.into();
        assert!(matches!(err, Error::Pool(_)));
    }
}

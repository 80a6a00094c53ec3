//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::bus::DEFAULT_QUEUE_CAPACITY;
use crate::error::ConfigError;

/// Message bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Default per-consumer queue capacity.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Memory aggregator configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Results pulled from one pool per store call.
    pub batch_size: usize,
    /// Upper bound on batches per pool per cycle.
    pub max_batches_per_cycle: usize,
    /// Periodic sync interval.
    pub interval: Duration,
    /// Deadline for each store call.
    pub store_timeout: Duration,
    /// Dedup keys remembered across cycles.
    pub seen_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batches_per_cycle: 10,
            interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(10),
            seen_capacity: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

/// Pool manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-pool bound for `health_report` and least-loaded probes.
    pub health_timeout: Duration,
    /// Per-pool bound for `close_pool` / `close_all`.
    pub close_timeout: Duration,
    /// Subscribe each pool to TASK_DELEGATE messages.
    pub delegation_enabled: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(30),
            delegation_enabled: true,
        }
    }
}

impl ManagerConfig {
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_delegation(mut self, enabled: bool) -> Self {
        self.delegation_enabled = enabled;
        self
    }
}

/// Remote manager used by delegated pools.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub token: Option<SecretString>,
    pub timeout: Duration,
}

/// Process-level configuration for the orchestrator binary.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bus: BusConfig,
    pub sync: SyncConfig,
    pub manager: ManagerConfig,
    pub remote: Option<RemoteConfig>,
    pub db_path: PathBuf,
    /// Command line run per task by direct and cluster workers.
    pub worker_command: String,
    pub listen_addr: SocketAddr,
    /// Bearer token required by the remote-manager HTTP surface.
    pub api_token: Option<SecretString>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            sync: SyncConfig::default(),
            manager: ManagerConfig::default(),
            remote: None,
            db_path: PathBuf::from("./data/pool-orchestrator.db"),
            worker_command: "cat".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8800)),
            api_token: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load from `ORCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ORCH_BUS_QUEUE_CAPACITY") {
            config.bus.queue_capacity = parse_positive("ORCH_BUS_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("ORCH_SYNC_INTERVAL_SECS") {
            config.sync.interval = Duration::from_secs(parse_positive("ORCH_SYNC_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("ORCH_SYNC_BATCH_SIZE") {
            config.sync.batch_size = parse_positive("ORCH_SYNC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("ORCH_SYNC_TIMEOUT_SECS") {
            config.sync.store_timeout = Duration::from_secs(parse_positive("ORCH_SYNC_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("ORCH_HEALTH_TIMEOUT_MS") {
            config.manager.health_timeout = Duration::from_millis(parse_positive("ORCH_HEALTH_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("ORCH_CLOSE_TIMEOUT_SECS") {
            config.manager.close_timeout = Duration::from_secs(parse_positive("ORCH_CLOSE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("ORCH_DELEGATION") {
            config.manager.delegation_enabled = parse_bool("ORCH_DELEGATION", &v)?;
        }
        if let Some(url) = get("ORCH_REMOTE_URL") {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    key: "ORCH_REMOTE_URL".into(),
                    message: format!("expected an http(s) URL, got {url}"),
                });
            }
            let timeout = match get("ORCH_REMOTE_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(parse_positive("ORCH_REMOTE_TIMEOUT_SECS", &v)?),
                None => Duration::from_secs(30),
            };
            config.remote = Some(RemoteConfig {
                url,
                token: get("ORCH_REMOTE_TOKEN").map(SecretString::from),
                timeout,
            });
        }
        if let Some(v) = get("ORCH_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("ORCH_WORKER_COMMAND") {
            config.worker_command = v;
        }
        if let Some(v) = get("ORCH_LISTEN_ADDR") {
            config.listen_addr = parse("ORCH_LISTEN_ADDR", &v)?;
        }
        config.api_token = get("ORCH_API_TOKEN").map(SecretString::from);

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(key, value)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<OrchestratorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bus.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert!(config.remote.is_none());
        assert!(config.manager.delegation_enabled);
        assert_eq!(config.worker_command, "cat");
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("ORCH_BUS_QUEUE_CAPACITY", "2"),
            ("ORCH_SYNC_INTERVAL_SECS", "5"),
            ("ORCH_SYNC_BATCH_SIZE", "25"),
            ("ORCH_HEALTH_TIMEOUT_MS", "150"),
            ("ORCH_REMOTE_URL", "http://10.0.0.5:8800"),
            ("ORCH_REMOTE_TOKEN", "s3cret"),
            ("ORCH_LISTEN_ADDR", "0.0.0.0:9000"),
            ("ORCH_DELEGATION", "off"),
        ])
        .unwrap();

        assert_eq!(config.bus.queue_capacity, 2);
        assert_eq!(config.sync.interval, Duration::from_secs(5));
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.manager.health_timeout, Duration::from_millis(150));
        assert!(!config.manager.delegation_enabled);
        assert_eq!(config.listen_addr.port(), 9000);

        let remote = config.remote.unwrap();
        assert_eq!(remote.url, "http://10.0.0.5:8800");
        assert_eq!(remote.token.unwrap().expose_secret(), "s3cret");
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = load(&[("ORCH_SYNC_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ORCH_SYNC_BATCH_SIZE"));

        let err = load(&[("ORCH_BUS_QUEUE_CAPACITY", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        assert!(load(&[("ORCH_REMOTE_URL", "ftp://x")]).is_err());
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = load(&[("ORCH_WORKER_COMMAND", "  ")]).unwrap();
        assert_eq!(config.worker_command, "cat");
    }
}

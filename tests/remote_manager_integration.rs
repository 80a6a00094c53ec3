//! Delegated pools talking to a real remote-manager HTTP surface.
//!
//! Each test starts an Axum server on a random port and drives it through
//! `HttpRemoteClient`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use pool_orchestrator::backends::{BackendFactory, HttpRemoteClient, RemoteManagerClient};
use pool_orchestrator::bus::MessageBus;
use pool_orchestrator::config::ManagerConfig;
use pool_orchestrator::error::{ErrorClass, RemoteError, RuntimeError};
use pool_orchestrator::manager::PoolManager;
use pool_orchestrator::manager::routes::remote_manager_routes;
use pool_orchestrator::pool::{BackendType, PoolConfig, PoolStatus, Task};
use pool_orchestrator::runtime::WorkerRuntime;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "integration-token";

struct EchoRuntime;

#[async_trait]
impl WorkerRuntime for EchoRuntime {
    async fn start_worker(&self, _worker_id: &str, _worker_type: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn run(&self, worker_id: &str, task: &Task) -> Result<Value, RuntimeError> {
        Ok(json!({"worker": worker_id, "echo": task.to_json()}))
    }

    async fn stop_worker(&self, _worker_id: &str) {}
}

/// Start a remote manager on a random port, return (base_url, manager).
async fn start_remote() -> (String, Arc<PoolManager>) {
    let manager = PoolManager::new(
        BackendFactory::new(Arc::new(EchoRuntime)),
        Arc::new(MessageBus::default()),
        ManagerConfig::default(),
    );
    let app = remote_manager_routes(manager.clone(), Some(SecretString::from(TOKEN)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), manager)
}

fn client(base_url: &str, token: &str) -> HttpRemoteClient {
    HttpRemoteClient::new(base_url, Some(SecretString::from(token)), Duration::from_secs(2)).unwrap()
}

fn local_manager(client: HttpRemoteClient) -> Arc<PoolManager> {
    PoolManager::new(
        BackendFactory::new(Arc::new(EchoRuntime)).with_remote(Arc::new(client)),
        Arc::new(MessageBus::default()),
        ManagerConfig::default(),
    )
}

#[tokio::test]
async fn delegated_pool_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let (url, remote) = start_remote().await;
        let local = local_manager(client(&url, TOKEN));

        let config = PoolConfig::new("edge", BackendType::Delegated, "agent").with_workers(1, 4);
        let pool_id = local.spawn_pool(config).await.unwrap();

        // The remote side holds a direct pool of the fixed delegated size.
        let remote_pools = remote.list_pools().await;
        assert_eq!(remote_pools.len(), 1);
        assert_eq!(remote_pools[0].backend_type, BackendType::Direct);
        assert_eq!(remote_pools[0].worker_count, 3);

        let result = local
            .execute_on_pool(&pool_id, Task::prompt("over the wire"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.pool_id, pool_id);
        assert_eq!(result.output.unwrap()["echo"]["prompt"], "over the wire");

        let health = local.pool(&pool_id).await.unwrap().health().await;
        assert_eq!(health.status, PoolStatus::Active);

        let err = local.scale_pool(&pool_id, 4).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::CapabilityNotSupported);

        local.close_pool(&pool_id).await.unwrap();
        assert!(remote.list_pools().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn remote_errors_arrive_structured() {
    timeout(TEST_TIMEOUT, async {
        let (url, _remote) = start_remote().await;
        let client = client(&url, TOKEN);

        let err = client.execute("ghost", &Task::prompt("x")).await.unwrap_err();
        match err {
            RemoteError::Remote { class, retryable, .. } => {
                assert_eq!(class, ErrorClass::PoolNotFound);
                assert!(!retryable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wrong_token_fails_spawn() {
    timeout(TEST_TIMEOUT, async {
        let (url, remote) = start_remote().await;
        let local = local_manager(client(&url, "wrong"));

        let config = PoolConfig::new("edge", BackendType::Delegated, "agent").with_workers(3, 3);
        let err = local.spawn_pool(config).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::BackendUnavailable);
        assert!(local.list_pools().await.is_empty());
        assert!(remote.list_pools().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_remote_marks_pool_degraded() {
    timeout(TEST_TIMEOUT, async {
        let (url, remote) = start_remote().await;
        let local = local_manager(client(&url, TOKEN));
        let pool_id = local
            .spawn_pool(PoolConfig::new("edge", BackendType::Delegated, "agent").with_workers(3, 3))
            .await
            .unwrap();

        // Pull the pool out from under the delegated side.
        let remote_id = remote.list_pools().await[0].pool_id.clone();
        remote.close_pool(&remote_id).await.unwrap();

        let health = local.pool(&pool_id).await.unwrap().health().await;
        assert_eq!(health.status, PoolStatus::Degraded);
        assert!(health.last_error.is_some());
    })
    .await
    .expect("test timed out");
}

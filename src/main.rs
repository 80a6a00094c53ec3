use std::sync::Arc;

use anyhow::Context;

use pool_orchestrator::backends::{BackendFactory, HttpRemoteClient, LocalCluster};
use pool_orchestrator::bus::MessageBus;
use pool_orchestrator::config::OrchestratorConfig;
use pool_orchestrator::manager::PoolManager;
use pool_orchestrator::manager::routes::orchestrator_routes;
use pool_orchestrator::memory::{LibSqlMemoryStore, MemoryAggregator};
use pool_orchestrator::runtime::CommandRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;

    eprintln!("Pool Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listen: http://{}", config.listen_addr);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worker command: {}", config.worker_command);

    // ── Memory store ─────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlMemoryStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open memory store at {}", config.db_path.display()))?,
    );

    // ── Backends ─────────────────────────────────────────────────────────
    let runtime = Arc::new(
        CommandRuntime::from_command_line(&config.worker_command)
            .context("ORCH_WORKER_COMMAND is empty")?,
    );
    let mut factory = BackendFactory::new(runtime.clone())
        .with_cluster(Arc::new(LocalCluster::new(runtime)));

    if let Some(remote) = &config.remote {
        let client = HttpRemoteClient::new(&remote.url, remote.token.clone(), remote.timeout)
            .context("failed to build remote manager client")?;
        factory = factory.with_remote(Arc::new(client));
        eprintln!("   Remote manager: {}", remote.url);
    } else {
        eprintln!("   Remote manager: none (delegated pools disabled)");
    }

    // ── Manager + aggregator ────────────────────────────────────────────
    let bus = Arc::new(MessageBus::new(config.bus.queue_capacity));
    let manager = PoolManager::new(factory, bus, config.manager.clone());
    let aggregator = Arc::new(MemoryAggregator::new(store, config.sync.clone()));

    let sync = aggregator
        .clone()
        .start_periodic_sync(manager.clone(), config.sync.interval)
        .await
        .context("memory store did not answer")?;

    // ── HTTP surface ─────────────────────────────────────────────────────
    if config.api_token.is_none() {
        tracing::warn!("ORCH_API_TOKEN not set; /api routes are unauthenticated");
    }
    let app = orchestrator_routes(manager.clone(), aggregator.clone(), config.api_token.clone());
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Remote manager surface started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    sync.shutdown().await;
    let summary = manager.close_all().await;
    for failure in &summary.failed {
        tracing::warn!(pool_id = %failure.pool_id, error = %failure.message, "Pool did not close cleanly");
    }
    tracing::info!(closed = summary.closed.len(), "All pools closed");

    // Closed pools keep unsynced history until this drains it.
    let stats = aggregator.collect_and_sync(&manager).await;
    tracing::info!(stored = stats.stored, failed = stats.pools_failed, "Final sync complete");
    Ok(())
}

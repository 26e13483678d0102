//! Orchestrator server binary: wires configuration, telemetry, shard
//! ownership, the dispatcher worker pool, and the admin HTTP surface into one
//! process, with graceful shutdown on ctrl_c.

mod http;
mod telemetry;

use std::sync::Arc;

use anyhow::Context as _;
use orchestrator_core::prelude::*;
use orchestrator_core::persistence::{
    HistoryRepository, InMemoryExecutionRepository, InMemoryHistoryRepository,
    InMemoryShardRepository, InMemoryTaskQueueRepository, InMemoryVisibilityRepository,
    PostgresExecutionRepository, PostgresHistoryRepository, PostgresShardRepository,
    PostgresTaskQueueRepository, PostgresVisibilityRepository, ShardRepository, TaskQueueRepository,
    VisibilityRepository, WorkflowExecutionRepository,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env();
    let _telemetry_guard = telemetry::init_telemetry(telemetry::TelemetryConfig::from_env());

    info!(shard_count = config.shard_count, http_addr = %config.http_addr, "starting orchestrator server");

    let identity = format!("{}-{}", hostname(), std::process::id());

    let (executions, history, visibility, tasks, shards): (
        Arc<dyn WorkflowExecutionRepository>,
        Arc<dyn HistoryRepository>,
        Arc<dyn VisibilityRepository>,
        Arc<dyn TaskQueueRepository>,
        Arc<dyn ShardRepository>,
    ) = if let Some(conn) = &config.db_connection {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(conn)
            .await
            .context("connecting to postgres")?;
        (
            Arc::new(PostgresExecutionRepository::new(pool.clone())),
            Arc::new(PostgresHistoryRepository::new(pool.clone())),
            Arc::new(PostgresVisibilityRepository::new(pool.clone())),
            Arc::new(PostgresTaskQueueRepository::new(pool.clone())),
            Arc::new(PostgresShardRepository::new(pool)),
        )
    } else {
        info!("no ORCH_DB_CONNECTION set, running with in-memory repositories");
        (
            Arc::new(InMemoryExecutionRepository::new()),
            Arc::new(InMemoryHistoryRepository::new()),
            Arc::new(InMemoryVisibilityRepository::new()),
            Arc::new(InMemoryTaskQueueRepository::new()),
            Arc::new(InMemoryShardRepository::new()),
        )
    };

    shards
        .initialize_shards(config.shard_count)
        .await
        .context("initializing shards")?;

    let shard_manager = Arc::new(ShardManager::new(
        shards,
        identity.clone(),
        ShardManagerConfig::new(config.shard_count, config.lease_duration),
    ));
    shard_manager.acquire_available_shards().await;
    shard_manager.start_reclaim_sweep();

    let history_service = Arc::new(HistoryService::new(
        executions,
        history,
        visibility,
        tasks.clone(),
        shard_manager.clone(),
        config.shard_count,
    ));
    let matching_service = Arc::new(MatchingService::new(tasks));

    // Workflow implementations are registered by downstream consumers that
    // depend on this crate; a freshly started server has none registered
    // until that wiring is added.
    let registry = Arc::new(WorkflowRegistry::new());

    let dispatcher_config = DispatcherConfig::new("default", identity.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        history_service.clone(),
        matching_service.clone(),
        registry,
        dispatcher_config,
    ));

    let namespace_id = uuid::Uuid::nil();
    let worker_pool = Arc::new(WorkerPool::new(
        dispatcher,
        namespace_id,
        WorkerPoolConfig::new(config.worker_concurrency),
    ));
    worker_pool.start().context("starting worker pool")?;

    let app_state = http::AppState {
        shard_manager: shard_manager.clone(),
        matching: matching_service,
    };
    let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding http admin surface on {}", config.http_addr))?;

    let cancellation = CancellationToken::new();
    let http_cancellation = cancellation.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, http::router(app_state))
            .with_graceful_shutdown(async move { http_cancellation.cancelled().await })
            .await
    });

    info!(addr = %config.http_addr, "admin HTTP surface listening");
    info!(addr = %config.rpc_addr, "rpc listener address reserved (wire protocol not yet implemented)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    cancellation.cancel();
    let _ = http_server.await;
    worker_pool.shutdown().await.context("shutting down worker pool")?;
    shard_manager.shutdown().await;

    info!("orchestrator server stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "orchestrator".to_string())
}

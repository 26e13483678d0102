//! Concurrent worker pool benchmark.
//!
//! Measures dispatcher throughput under `N` concurrent `run_once` loops
//! draining a shared queue of pre-enqueued noop workflows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::history_service::HistoryService;
use orchestrator_core::matching::MatchingService;
use orchestrator_core::persistence::{
    InMemoryExecutionRepository, InMemoryHistoryRepository, InMemoryShardRepository,
    InMemoryTaskQueueRepository, InMemoryVisibilityRepository,
};
use orchestrator_core::runtime::{Context, Workflow};
use orchestrator_core::shard_manager::{ShardManager, ShardManagerConfig};
use orchestrator_core::engine::WorkflowRegistry;

struct Noop;

#[async_trait]
impl Workflow for Noop {
    const WORKFLOW_TYPE: &'static str = "bench_noop";
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    async fn execute(&self, _ctx: &Context, _input: Self::Input) -> Result<Self::Output, OrchestratorError> {
        Ok(serde_json::Value::Null)
    }
}

async fn build_dispatcher(shard_count: u32) -> (Arc<Dispatcher>, Arc<HistoryService>, Uuid) {
    let shard_repo = Arc::new(InMemoryShardRepository::new());
    shard_repo.initialize_shards(shard_count).await.unwrap();
    let shards = Arc::new(ShardManager::new(
        shard_repo,
        "bench-node",
        ShardManagerConfig::new(shard_count, Duration::from_secs(60)),
    ));
    shards.acquire_available_shards().await;

    let tasks = Arc::new(InMemoryTaskQueueRepository::new());
    let history = Arc::new(HistoryService::new(
        Arc::new(InMemoryExecutionRepository::new()),
        Arc::new(InMemoryHistoryRepository::new()),
        Arc::new(InMemoryVisibilityRepository::new()),
        tasks.clone(),
        shards,
        shard_count,
    ));
    let matching = Arc::new(MatchingService::new(tasks));

    let mut registry = WorkflowRegistry::new();
    registry.register(Noop);

    let mut config = DispatcherConfig::new("bench-queue", "bench-worker");
    config.poll_timeout = Duration::from_millis(250);
    config.heartbeat_interval = Duration::from_secs(30);

    let dispatcher = Arc::new(Dispatcher::new(history.clone(), matching, Arc::new(registry), config));
    (dispatcher, history, Uuid::now_v7())
}

fn bench_concurrent_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_workers/drain");
    group.sample_size(10);

    for workers in [1, 4, 8, 16] {
        let task_count = 500u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let (dispatcher, history, namespace_id) = build_dispatcher(8).await;

                for i in 0..task_count {
                    history
                        .start_workflow(
                            namespace_id,
                            format!("wf-{i}"),
                            Uuid::now_v7(),
                            "bench_noop".to_string(),
                            "bench-queue".to_string(),
                            serde_json::Value::Null,
                            serde_json::Value::Null,
                        )
                        .await
                        .unwrap();
                }

                let completed = Arc::new(std::sync::atomic::AtomicU64::new(0));
                let mut handles = Vec::new();
                for _ in 0..workers {
                    let dispatcher = dispatcher.clone();
                    let completed = completed.clone();
                    handles.push(tokio::spawn(async move {
                        let token = CancellationToken::new();
                        loop {
                            if completed.load(std::sync::atomic::Ordering::Relaxed) >= task_count {
                                break;
                            }
                            match dispatcher.run_once(namespace_id, &token).await {
                                Ok(orchestrator_core::dispatcher::DispatchOutcome::Completed { .. }) => {
                                    completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                }
                                Ok(orchestrator_core::dispatcher::DispatchOutcome::NoTask) => {
                                    if completed.load(std::sync::atomic::Ordering::Relaxed) >= task_count {
                                        break;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }));
                }

                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_drain);
criterion_main!(benches);

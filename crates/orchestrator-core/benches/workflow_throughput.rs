//! Workflow throughput benchmark.
//!
//! Models thousands of independently-scheduled workflow executions landing
//! on one task queue, drained by a pool of dispatcher loops. This crate's
//! `Workflow::execute` is a single opaque unit of work rather than a chain
//! of re-enqueued activity steps, so "steps per workflow" here becomes
//! "workflows per scenario" at increasing scale rather than a sequential
//! chain within one execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orchestrator_core::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
use orchestrator_core::engine::WorkflowRegistry;
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::history_service::HistoryService;
use orchestrator_core::matching::MatchingService;
use orchestrator_core::persistence::{
    InMemoryExecutionRepository, InMemoryHistoryRepository, InMemoryShardRepository,
    InMemoryTaskQueueRepository, InMemoryVisibilityRepository,
};
use orchestrator_core::runtime::Context;
use orchestrator_core::runtime::Workflow;
use orchestrator_core::shard_manager::{ShardManager, ShardManagerConfig};

struct BenchStep;

#[async_trait]
impl Workflow for BenchStep {
    const WORKFLOW_TYPE: &'static str = "bench_step";
    type Input = serde_json::Value;
    type Output = serde_json::Value;

    async fn execute(&self, _ctx: &Context, _input: Self::Input) -> Result<Self::Output, OrchestratorError> {
        Ok(serde_json::Value::Null)
    }
}

async fn run_scenario(workflow_count: u64, worker_count: usize) -> Duration {
    let shard_count = 16;
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
    registry.register(BenchStep);

    let mut config = DispatcherConfig::new("bench-queue", "bench-worker");
    config.poll_timeout = Duration::from_millis(250);
    config.heartbeat_interval = Duration::from_secs(30);

    let dispatcher = Arc::new(Dispatcher::new(history.clone(), matching, Arc::new(registry), config));
    let namespace_id = Uuid::now_v7();

    for i in 0..workflow_count {
        history
            .start_workflow(
                namespace_id,
                format!("wf-{i}"),
                Uuid::now_v7(),
                "bench_step".to_string(),
                "bench-queue".to_string(),
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
    }

    let completed = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let start = std::time::Instant::now();
    let mut handles = Vec::new();
    for _ in 0..worker_count {
        let dispatcher = dispatcher.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            let token = CancellationToken::new();
            loop {
                if completed.load(std::sync::atomic::Ordering::Relaxed) >= workflow_count {
                    break;
                }
                match dispatcher.run_once(namespace_id, &token).await {
                    Ok(DispatchOutcome::Completed { .. }) => {
                        completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    Ok(DispatchOutcome::NoTask) => {
                        if completed.load(std::sync::atomic::Ordering::Relaxed) >= workflow_count {
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

    start.elapsed()
}

fn bench_workflow_scale(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("workflow_throughput/scale");
    group.sample_size(10);

    for (workflow_count, worker_count) in [(200u64, 10usize), (1000, 50), (2000, 100)] {
        group.throughput(Throughput::Elements(workflow_count));
        group.bench_with_input(
            BenchmarkId::new("workflows", workflow_count),
            &(workflow_count, worker_count),
            |b, &(workflow_count, worker_count)| {
                b.to_async(&rt).iter(|| async move { run_scenario(workflow_count, worker_count).await });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_workflow_scale);
criterion_main!(benches);

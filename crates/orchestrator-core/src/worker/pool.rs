//! Worker pool: runs N concurrent dispatcher loops against one task queue.
//!
//! Each concurrency slot is a standalone loop over `Dispatcher::run_once`,
//! which already polls, executes, and completes one task end to end, rather
//! than a semaphore-gated spawn per claimed task. Shutdown is coordinated
//! through a watch-channel signal and tracked `JoinHandle`s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::OrchestratorError;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub worker_group: String,
    /// Number of concurrent dispatcher loops to run.
    pub concurrency: usize,
    pub backpressure: BackpressureConfig,
    /// Sleep after a `NoTask` poll before retrying, to avoid a hot loop.
    #[serde(with = "duration_millis")]
    pub idle_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_group: "default".to_string(),
            concurrency: 10,
            backpressure: BackpressureConfig::default(),
            idle_backoff: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("dispatcher error: {0}")]
    Dispatch(#[from] OrchestratorError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Runs `config.concurrency` independent dispatcher loops against one
/// namespace/task queue until shut down.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    namespace_id: Uuid,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    status: RwLock<WorkerPoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cancellation: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    completed_count: AtomicUsize,
    failed_count: AtomicUsize,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, namespace_id: Uuid, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.concurrency,
        ));
        Self {
            dispatcher,
            namespace_id,
            config,
            backpressure,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            shutdown_tx,
            shutdown_rx,
            cancellation: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            completed_count: AtomicUsize::new(0),
            failed_count: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed_count.load(Ordering::Relaxed)
    }

    #[instrument(skip(self), fields(worker_group = %self.config.worker_group, concurrency = self.config.concurrency))]
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }
        *self.status.write().unwrap() = WorkerPoolStatus::Starting;
        info!("starting worker pool");

        let mut handles = self.handles.lock().unwrap();
        for slot in 0..self.config.concurrency {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pool.run_loop(slot).await;
            }));
        }
        drop(handles);

        *self.status.write().unwrap() = WorkerPoolStatus::Running;
        Ok(())
    }

    async fn run_loop(&self, slot: usize) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if !self.backpressure.should_accept() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            self.backpressure.task_started();
            let outcome = tokio::select! {
                result = self.dispatcher.run_once(self.namespace_id, &self.cancellation) => result,
                _ = shutdown_rx.changed() => {
                    self.backpressure.task_completed();
                    break;
                }
            };
            self.backpressure.task_completed();

            match outcome {
                Ok(DispatchOutcome::NoTask) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_backoff) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Ok(DispatchOutcome::Completed { workflow_id, run_id }) => {
                    self.completed_count.fetch_add(1, Ordering::Relaxed);
                    debug!(slot, %workflow_id, %run_id, "workflow completed");
                }
                Ok(DispatchOutcome::Failed { workflow_id, run_id, requeued }) => {
                    self.failed_count.fetch_add(1, Ordering::Relaxed);
                    debug!(slot, %workflow_id, %run_id, requeued, "workflow task failed");
                }
                Err(OrchestratorError::Canceled) => break,
                Err(e) => {
                    warn!(slot, error = %e, "dispatcher loop error");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_backoff) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read().unwrap();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }
        info!("initiating graceful shutdown");
        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        self.cancellation.cancel();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.handles.lock().unwrap());
        let join_all = futures::future::join_all(handles);
        match tokio::time::timeout(self.config.shutdown_timeout, join_all).await {
            Ok(_) => {
                *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
                info!("worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!("shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::engine::WorkflowRegistry;
    use crate::history_service::HistoryService;
    use crate::matching::MatchingService;
    use crate::persistence::{
        InMemoryExecutionRepository, InMemoryHistoryRepository, InMemoryShardRepository,
        InMemoryTaskQueueRepository, InMemoryVisibilityRepository,
    };
    use crate::runtime::{Context, Workflow};
    use crate::shard_manager::{ShardManager, ShardManagerConfig};
    use async_trait::async_trait;
    use serde::{Deserialize as De, Serialize as Se};

    #[derive(Debug, De)]
    struct NoopInput {}

    #[derive(Debug, Se)]
    struct NoopOutput {}

    struct Noop;

    #[async_trait]
    impl Workflow for Noop {
        const WORKFLOW_TYPE: &'static str = "noop";
        type Input = NoopInput;
        type Output = NoopOutput;

        async fn execute(&self, _ctx: &Context, _input: Self::Input) -> Result<Self::Output, OrchestratorError> {
            Ok(NoopOutput {})
        }
    }

    #[tokio::test]
    async fn pool_drains_queued_workflows_then_shuts_down() {
        let shard_repo = Arc::new(InMemoryShardRepository::new());
        shard_repo.initialize_shards(4).await.unwrap();
        let shards = Arc::new(ShardManager::new(
            shard_repo,
            "node-a",
            ShardManagerConfig::new(4, Duration::from_secs(30)),
        ));
        shards.acquire_available_shards().await;

        let tasks = Arc::new(InMemoryTaskQueueRepository::new());
        let history = Arc::new(HistoryService::new(
            Arc::new(InMemoryExecutionRepository::new()),
            Arc::new(InMemoryHistoryRepository::new()),
            Arc::new(InMemoryVisibilityRepository::new()),
            tasks.clone(),
            shards,
            4,
        ));
        let matching = Arc::new(MatchingService::new(tasks));
        let mut registry = WorkflowRegistry::new();
        registry.register(Noop);

        let ns = Uuid::now_v7();
        for i in 0..5 {
            history
                .start_workflow(
                    ns,
                    format!("wf-{i}"),
                    Uuid::now_v7(),
                    "noop".to_string(),
                    "q".to_string(),
                    serde_json::Value::Null,
                    serde_json::Value::Null,
                )
                .await
                .unwrap();
        }

        let mut dispatcher_config = DispatcherConfig::new("q", "worker-pool-test");
        dispatcher_config.poll_timeout = Duration::from_millis(200);
        dispatcher_config.heartbeat_interval = Duration::from_secs(30);
        let dispatcher = Arc::new(Dispatcher::new(
            history.clone(),
            matching,
            Arc::new(registry),
            dispatcher_config,
        ));

        let pool = Arc::new(WorkerPool::new(dispatcher, ns, WorkerPoolConfig::new(3)));
        pool.start().unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Running);

        tokio::time::sleep(Duration::from_millis(500)).await;
        pool.shutdown().await.unwrap();

        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(pool.completed_count(), 5);
    }
}

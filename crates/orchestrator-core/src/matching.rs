//! Matching service: the worker-facing task dispatcher layered over the
//! persistent task queue store. The store-level poll itself uses a
//! `FOR UPDATE SKIP LOCKED` pattern, which lives in `persistence::task_queue`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{TaskLease, TaskQueueItem, TaskQueueType};
use crate::persistence::{QueueStats, TaskQueueRepository, DEFAULT_REQUEUE_DELAY};

/// Upper bound on the sleep between poll attempts within one long-poll call.
const POLL_RETRY_INTERVAL: Duration = Duration::from_millis(250);

pub struct MatchingService {
    repo: std::sync::Arc<dyn TaskQueueRepository>,
}

impl MatchingService {
    pub fn new(repo: std::sync::Arc<dyn TaskQueueRepository>) -> Self {
        Self { repo }
    }

    #[instrument(skip(self, item))]
    pub async fn enqueue_task(&self, item: TaskQueueItem) -> Result<(), OrchestratorError> {
        self.repo.enqueue(item).await
    }

    /// Long-poll: retries the atomic store-level poll until a task is
    /// found, the cancellation token fires, or `timeout` elapses. Returns
    /// `Ok(None)` on timeout with no task found — this is not an error, the
    /// caller simply polls again.
    #[instrument(skip(self, cancellation))]
    pub async fn poll_task(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
        queue_type: TaskQueueType,
        worker_identity: &str,
        lease_duration: Duration,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<Option<(TaskQueueItem, TaskLease)>, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if cancellation.is_cancelled() {
                return Err(OrchestratorError::Canceled);
            }

            match self
                .repo
                .poll(namespace_id, queue_name, queue_type, worker_identity, lease_duration)
                .await
            {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep_for = POLL_RETRY_INTERVAL.min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancellation.cancelled() => return Err(OrchestratorError::Canceled),
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn heartbeat_task(
        &self,
        lease_id: Uuid,
        extension: Duration,
    ) -> Result<TaskLease, OrchestratorError> {
        self.repo.heartbeat(lease_id, extension).await
    }

    #[instrument(skip(self))]
    pub async fn complete_task(&self, lease_id: Uuid) -> Result<(), OrchestratorError> {
        self.repo.complete(lease_id).await
    }

    /// `requeue = true` reschedules at `now + backoff` (default
    /// `ORCH_REQUEUE_DELAY_SECONDS`); `requeue = false` deletes the task.
    #[instrument(skip(self))]
    pub async fn fail_task(
        &self,
        lease_id: Uuid,
        reason: &str,
        requeue: bool,
    ) -> Result<(), OrchestratorError> {
        self.repo.fail(lease_id, reason, requeue, DEFAULT_REQUEUE_DELAY).await
    }

    #[instrument(skip(self))]
    pub async fn fail_task_with_backoff(
        &self,
        lease_id: Uuid,
        reason: &str,
        requeue: bool,
        backoff: Duration,
    ) -> Result<(), OrchestratorError> {
        self.repo.fail(lease_id, reason, requeue, backoff).await
    }

    #[instrument(skip(self))]
    pub async fn queue_depth(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
    ) -> Result<QueueStats, OrchestratorError> {
        self.repo.depth(namespace_id, queue_name).await
    }

    #[instrument(skip(self))]
    pub async fn list_queues(
        &self,
        namespace_id: Option<Uuid>,
    ) -> Result<std::collections::HashMap<String, i64>, OrchestratorError> {
        self.repo.list_queues(namespace_id).await
    }

    /// Slow background sweep: deletes leases whose `leaseExpiresAt` has
    /// passed, making their tasks eligible for re-polling. This is the
    /// recovery path when a worker crashes without failing the task.
    #[instrument(skip(self))]
    pub async fn reclaim_expired_leases(&self) -> Result<u64, OrchestratorError> {
        let reclaimed = self.repo.reclaim_expired_leases().await?;
        if reclaimed > 0 {
            debug!(count = reclaimed, "reclaimed expired task leases");
        }
        Ok(reclaimed)
    }
}

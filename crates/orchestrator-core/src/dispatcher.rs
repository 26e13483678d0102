//! Dispatcher: the worker-facing pipeline wiring polled tasks to the
//! workflow runtime.
//!
//! Pipeline: poll one task -> resolve `workflowType` via the registry ->
//! decode the opaque input -> build a `Context` bound to this task ->
//! invoke the workflow -> on success, append history + update execution +
//! complete the lease; on transient failure, fail with requeue; on a
//! deterministic workflow bug (e.g. a version-gate mismatch), fail without
//! requeue so the history remains intact for investigation. Heartbeats the
//! lease on a fixed cadence for the duration of the invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::WorkflowRegistry;
use crate::error::OrchestratorError;
use crate::history_service::HistoryService;
use crate::matching::MatchingService;
use crate::model::{HistoryEvent, TaskQueueType};
use crate::runtime::Context;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub task_queue: String,
    pub worker_identity: String,
    /// Lease duration requested on poll (`ORCH_LEASE_DURATION_SECONDS`, default 60s).
    pub lease_duration: Duration,
    /// Per-poll wall-clock timeout (default 30s).
    pub poll_timeout: Duration,
    /// Cadence of in-flight heartbeats. SHOULD be <= `lease_duration / 3`.
    pub heartbeat_interval: Duration,
    /// Heartbeat lease extension (`ORCH_HEARTBEAT_EXTENSION_SECONDS`, default 60s).
    pub heartbeat_extension: Duration,
}

impl DispatcherConfig {
    pub fn new(task_queue: impl Into<String>, worker_identity: impl Into<String>) -> Self {
        let lease_duration = Duration::from_secs(60);
        Self {
            task_queue: task_queue.into(),
            worker_identity: worker_identity.into(),
            lease_duration,
            poll_timeout: Duration::from_secs(30),
            heartbeat_interval: lease_duration / 3,
            heartbeat_extension: Duration::from_secs(60),
        }
    }
}

/// The observable result of one `run_once` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was available within the poll timeout.
    NoTask,
    /// The workflow ran to completion and its lease was completed.
    Completed { workflow_id: String, run_id: Uuid },
    /// The workflow invocation failed; `requeued` reflects whether the task
    /// was rescheduled (transient) or dropped (deterministic bug).
    Failed {
        workflow_id: String,
        run_id: Uuid,
        requeued: bool,
    },
}

pub struct Dispatcher {
    history: Arc<HistoryService>,
    matching: Arc<MatchingService>,
    registry: Arc<WorkflowRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        history: Arc<HistoryService>,
        matching: Arc<MatchingService>,
        registry: Arc<WorkflowRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            history,
            matching,
            registry,
            config,
        }
    }

    /// Poll and execute at most one task, end to end. Returns
    /// `Ok(DispatchOutcome::NoTask)` on a poll timeout with nothing found —
    /// that is not an error, the caller simply loops again.
    #[instrument(skip(self, cancellation), fields(queue = %self.config.task_queue))]
    pub async fn run_once(
        &self,
        namespace_id: Uuid,
        cancellation: &CancellationToken,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let Some((task, lease)) = self
            .matching
            .poll_task(
                namespace_id,
                &self.config.task_queue,
                TaskQueueType::Workflow,
                &self.config.worker_identity,
                self.config.lease_duration,
                self.config.poll_timeout,
                cancellation,
            )
            .await?
        else {
            return Ok(DispatchOutcome::NoTask);
        };

        let execution = match self
            .history
            .get_execution(namespace_id, &task.workflow_id, task.run_id)
            .await
        {
            Ok(e) => e,
            Err(e) => {
                warn!(workflow_id = %task.workflow_id, error = %e, "could not load execution for polled task");
                let requeued = self.fail_with_classification(lease.lease_id, &e).await;
                return Ok(DispatchOutcome::Failed {
                    workflow_id: task.workflow_id,
                    run_id: task.run_id,
                    requeued,
                });
            }
        };

        if !self.registry.contains(&execution.workflow_type) {
            let err = OrchestratorError::WorkflowNotRegistered(execution.workflow_type.clone());
            let requeued = self.fail_with_classification(lease.lease_id, &err).await;
            return Ok(DispatchOutcome::Failed {
                workflow_id: task.workflow_id,
                run_id: task.run_id,
                requeued,
            });
        }

        let ctx = Context::new(
            namespace_id.to_string(),
            task.workflow_id.clone(),
            task.run_id,
            self.config.task_queue.clone(),
            execution.started_at,
            0,
        );

        let invocation = self.run_with_heartbeat(
            lease.lease_id,
            self.registry
                .dispatch(&execution.workflow_type, &ctx, task.task_data.clone()),
        );

        match invocation.await {
            Ok(output) => {
                let (effects, versions) = ctx.into_recorded_state();
                let event = HistoryEvent {
                    namespace_id,
                    workflow_id: task.workflow_id.clone(),
                    run_id: task.run_id,
                    event_id: execution.next_event_id,
                    event_type: "WorkflowExecutionCompleted".to_string(),
                    event_timestamp: Utc::now(),
                    task_id: Some(task.task_id),
                    version: execution.version,
                    event_data: serde_json::json!({
                        "output": output,
                        "effects": effects.snapshot(),
                        "versions": versions.snapshot(),
                    }),
                };
                self.history
                    .append_events(namespace_id, &task.workflow_id, task.run_id, vec![event.clone()])
                    .await?;

                let mut completed = execution.clone();
                completed.state = crate::model::WorkflowExecutionState::Completed;
                completed.completed_at = Some(event.event_timestamp);
                completed.completion_event_id = Some(event.event_id);
                completed.next_event_id = execution.next_event_id + 1;
                self.history
                    .update_execution_with_next_event_id(
                        completed,
                        execution.version,
                        execution.next_event_id + 1,
                    )
                    .await?;

                self.matching.complete_task(lease.lease_id).await?;
                info!(workflow_id = %task.workflow_id, run_id = %task.run_id, "workflow execution completed");
                Ok(DispatchOutcome::Completed {
                    workflow_id: task.workflow_id,
                    run_id: task.run_id,
                })
            }
            Err(e) => {
                let requeued = self.fail_with_classification(lease.lease_id, &e).await;
                Ok(DispatchOutcome::Failed {
                    workflow_id: task.workflow_id,
                    run_id: task.run_id,
                    requeued,
                })
            }
        }
    }

    /// Runs an in-flight workflow invocation while heartbeating its lease on
    /// a fixed cadence. The heartbeat ticker is a side effect only — its
    /// failures are logged, never propagated, so a transient heartbeat hiccup
    /// never aborts an otherwise-succeeding invocation.
    async fn run_with_heartbeat<F, T>(&self, lease_id: Uuid, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await; // first tick fires immediately; discard it

        loop {
            tokio::select! {
                result = &mut fut => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.matching.heartbeat_task(lease_id, self.config.heartbeat_extension).await {
                        warn!(%lease_id, error = %e, "heartbeat failed");
                    } else {
                        debug!(%lease_id, "heartbeat sent");
                    }
                }
            }
        }
    }

    /// Classifies a dispatcher-level failure: transient errors (persistence
    /// hiccups, lost shard ownership, a vanished lease, a concurrency race)
    /// are requeued; deterministic bugs (a version-gate mismatch, an
    /// unregistered workflow type, malformed input) are not — the event log
    /// is left intact for investigation. Returns whether the task was
    /// requeued.
    async fn fail_with_classification(&self, lease_id: Uuid, err: &OrchestratorError) -> bool {
        let requeue = err.is_retryable() || matches!(err, OrchestratorError::Canceled);
        if let Err(fail_err) = self.matching.fail_task(lease_id, &err.to_string(), requeue).await {
            warn!(%lease_id, error = %fail_err, "failed to mark task as failed");
        }
        requeue
    }
}

//! History service: shard-ownership-checked event append, history reads,
//! and optimistic-concurrency execution updates.
//!
//! Execution state uses a `version` column for optimistic concurrency,
//! kept separate from the history log's own `event_id` sequence, so a
//! state update and an event append can be reasoned about independently
//! even though callers typically perform both together.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::hashing;
use crate::model::{HistoryEvent, WorkflowExecution, WorkflowExecutionState};
use crate::persistence::{
    HistoryPage, HistoryRepository, TaskQueueRepository, VisibilityRepository,
    WorkflowExecutionRepository,
};
use crate::shard_manager::ShardManager;

/// Coordinates the append-only event log with mutable execution state,
/// enforcing shard ownership on every write.
pub struct HistoryService {
    executions: Arc<dyn WorkflowExecutionRepository>,
    history: Arc<dyn HistoryRepository>,
    visibility: Arc<dyn VisibilityRepository>,
    tasks: Arc<dyn TaskQueueRepository>,
    shards: Arc<ShardManager>,
    shard_count: u32,
}

impl HistoryService {
    pub fn new(
        executions: Arc<dyn WorkflowExecutionRepository>,
        history: Arc<dyn HistoryRepository>,
        visibility: Arc<dyn VisibilityRepository>,
        tasks: Arc<dyn TaskQueueRepository>,
        shards: Arc<ShardManager>,
        shard_count: u32,
    ) -> Self {
        Self {
            executions,
            history,
            visibility,
            tasks,
            shards,
            shard_count,
        }
    }

    fn check_ownership(&self, workflow_id: &str) -> Result<u32, OrchestratorError> {
        let shard_id = hashing::shard_id(workflow_id, self.shard_count);
        if !self.shards.owns_locally(shard_id) {
            return Err(OrchestratorError::ShardUnavailable {
                shard_id,
                reason: "not owned by this process".to_string(),
            });
        }
        Ok(shard_id)
    }

    /// `StartWorkflow`: creates the execution row at `version = 1`, appends
    /// the initial `eventId = 1` event, and enqueues the first workflow
    /// task, all inside one logical operation.
    #[instrument(skip(self, execution, started_event, task_data))]
    pub async fn start_workflow(
        &self,
        namespace_id: Uuid,
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
        task_queue: String,
        started_event: serde_json::Value,
        task_data: serde_json::Value,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let shard_id = self.check_ownership(&workflow_id)?;

        let execution = WorkflowExecution::new_started(
            namespace_id,
            workflow_id.clone(),
            run_id,
            workflow_type.clone(),
            task_queue.clone(),
            shard_id,
        );
        let execution = self.executions.create(execution).await?;

        let event = HistoryEvent {
            namespace_id,
            workflow_id: workflow_id.clone(),
            run_id,
            event_id: 1,
            event_type: "WorkflowExecutionStarted".to_string(),
            event_timestamp: Utc::now(),
            task_id: Some(1),
            version: 1,
            event_data: started_event,
        };
        self.history
            .append_events(namespace_id, &workflow_id, run_id, vec![event])
            .await?;

        let partition = hashing::partition_hash(&task_queue, self.shard_count);
        self.tasks
            .enqueue(crate::model::TaskQueueItem {
                namespace_id,
                task_queue_name: task_queue,
                task_queue_type: crate::model::TaskQueueType::Workflow,
                task_id: 1,
                workflow_id: workflow_id.clone(),
                run_id,
                scheduled_at: Utc::now(),
                expiry_at: None,
                task_data,
                partition_hash: partition,
            })
            .await?;

        self.upsert_visibility(&execution).await?;
        debug!(workflow_id = %workflow_id, %run_id, "workflow started");
        Ok(execution)
    }

    /// `AppendEvents`: validates shard ownership, then delegates the
    /// contiguity check to the history repository. No implicit execution
    /// row update — callers pair this with `update_execution` when needed.
    #[instrument(skip(self, events))]
    pub async fn append_events(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        events: Vec<HistoryEvent>,
    ) -> Result<(), OrchestratorError> {
        self.check_ownership(workflow_id)?;
        self.history
            .append_events(namespace_id, workflow_id, run_id, events)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        from_event_id: i64,
        max_events: u32,
    ) -> Result<HistoryPage, OrchestratorError> {
        self.history
            .get_history(namespace_id, workflow_id, run_id, from_event_id.max(1), max_events.clamp(1, 5000))
            .await
    }

    #[instrument(skip(self))]
    pub async fn validate_history(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<bool, OrchestratorError> {
        self.history.validate_sequence(namespace_id, workflow_id, run_id).await
    }

    /// `UpdateAsync`: callers load the execution, mutate a copy, and call
    /// this with `expected_version`. Terminal transitions must already have
    /// `completed_at`/`completion_event_id` set by the caller — this method
    /// enforces but does not infer them.
    #[instrument(skip(self, execution))]
    pub async fn update_execution(
        &self,
        execution: WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.check_ownership(&execution.workflow_id)?;
        let updated = self.executions.update(execution, expected_version).await?;
        self.upsert_visibility(&updated).await?;
        Ok(updated)
    }

    /// As `update_execution`, but also advances `next_event_id` atomically
    /// — used when an update is paired with an event append in the same
    /// logical operation (e.g. a workflow task completion).
    #[instrument(skip(self, execution))]
    pub async fn update_execution_with_next_event_id(
        &self,
        execution: WorkflowExecution,
        expected_version: i64,
        next_event_id: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.check_ownership(&execution.workflow_id)?;
        let updated = self
            .executions
            .update_with_next_event_id(execution, expected_version, next_event_id)
            .await?;
        self.upsert_visibility(&updated).await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn get_execution(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.executions.get(namespace_id, workflow_id, run_id).await
    }

    #[instrument(skip(self))]
    pub async fn terminate(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.check_ownership(workflow_id)?;
        let terminated = self.executions.terminate(namespace_id, workflow_id, run_id, reason).await?;
        self.upsert_visibility(&terminated).await?;
        Ok(terminated)
    }

    async fn upsert_visibility(&self, execution: &WorkflowExecution) -> Result<(), OrchestratorError> {
        let history_length = self
            .history
            .get_event_count(execution.namespace_id, &execution.workflow_id, execution.run_id)
            .await
            .unwrap_or(0);

        self.visibility
            .upsert(crate::model::VisibilityRecord {
                namespace_id: execution.namespace_id,
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id,
                workflow_type: execution.workflow_type.clone(),
                task_queue: execution.task_queue.clone(),
                status: execution.state,
                start_time: execution.started_at,
                close_time: execution.completed_at,
                history_length,
                memo: execution.memo.clone(),
                search_attributes: execution.search_attributes.clone(),
                parent_workflow_id: execution.parent_workflow_id.clone(),
                tags: Default::default(),
            })
            .await
    }
}

/// A minimal, dependency-free state machine check: "Running -> any terminal
/// state; terminal -> none". Exposed standalone so callers (and tests) can
/// validate a proposed transition before round-tripping to the repository
/// layer.
pub fn validate_transition(
    current: WorkflowExecutionState,
    next: WorkflowExecutionState,
) -> Result<(), OrchestratorError> {
    if current.is_terminal() {
        return Err(OrchestratorError::InvalidWorkflowState(format!(
            "cannot transition out of terminal state {current:?}"
        )));
    }
    if next == WorkflowExecutionState::Running {
        return Err(OrchestratorError::InvalidWorkflowState(
            "Running -> Running is not a valid transition".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{
        InMemoryHistoryRepository, InMemoryShardRepository, InMemoryTaskQueueRepository,
        InMemoryVisibilityRepository,
    };
    use crate::shard_manager::ShardManagerConfig;
    use std::time::Duration;

    async fn service() -> (HistoryService, Uuid) {
        let shard_repo = Arc::new(InMemoryShardRepository::new());
        shard_repo.initialize_shards(4).await.unwrap();
        let manager = Arc::new(ShardManager::new(
            shard_repo,
            "node-a",
            ShardManagerConfig::new(4, Duration::from_secs(30)),
        ));
        manager.acquire_available_shards().await;

        let service = HistoryService::new(
            Arc::new(crate::persistence::InMemoryExecutionRepository::new()),
            Arc::new(InMemoryHistoryRepository::new()),
            Arc::new(InMemoryVisibilityRepository::new()),
            Arc::new(InMemoryTaskQueueRepository::new()),
            manager,
            4,
        );
        (service, Uuid::now_v7())
    }

    #[tokio::test]
    async fn start_workflow_creates_execution_and_first_event() {
        let (service, ns) = service().await;
        let run_id = Uuid::now_v7();
        let execution = service
            .start_workflow(
                ns,
                "wf-1".to_string(),
                run_id,
                "greet".to_string(),
                "q".to_string(),
                serde_json::json!({"input": "alice"}),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        assert_eq!(execution.version, 1);
        assert_eq!(execution.state, WorkflowExecutionState::Running);

        let history = service.get_history(ns, "wf-1", run_id, 1, 1000).await.unwrap();
        assert_eq!(history.events.len(), 1);
        assert_eq!(history.events[0].event_id, 1);
    }

    #[tokio::test]
    async fn concurrent_completion_one_wins() {
        let (service, ns) = service().await;
        let run_id = Uuid::now_v7();
        let execution = service
            .start_workflow(
                ns,
                "wf-2".to_string(),
                run_id,
                "greet".to_string(),
                "q".to_string(),
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let mut a = execution.clone();
        a.state = WorkflowExecutionState::Completed;
        a.completed_at = Some(Utc::now());
        a.completion_event_id = Some(2);

        let mut b = execution.clone();
        b.state = WorkflowExecutionState::Failed;
        b.completed_at = Some(Utc::now());
        b.completion_event_id = Some(2);

        let first = service.update_execution(a, 1).await;
        let second = service.update_execution(b, 1).await;
        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            OrchestratorError::ConcurrencyConflict { .. }
        ));
    }

    #[tokio::test]
    async fn append_rejected_without_shard_ownership() {
        let shard_repo = Arc::new(InMemoryShardRepository::new());
        shard_repo.initialize_shards(4).await.unwrap();
        let manager = Arc::new(ShardManager::new(
            shard_repo,
            "node-a",
            ShardManagerConfig::new(4, Duration::from_secs(30)),
        ));
        // Do not acquire any shards.
        let service = HistoryService::new(
            Arc::new(crate::persistence::InMemoryExecutionRepository::new()),
            Arc::new(InMemoryHistoryRepository::new()),
            Arc::new(InMemoryVisibilityRepository::new()),
            Arc::new(InMemoryTaskQueueRepository::new()),
            manager,
            4,
        );

        let err = service
            .append_events(Uuid::now_v7(), "wf-1", Uuid::now_v7(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ShardUnavailable { .. }));
    }

    #[tokio::test]
    async fn history_gap_rejected() {
        let (service, ns) = service().await;
        let run_id = Uuid::now_v7();
        service
            .start_workflow(
                ns,
                "wf-3".to_string(),
                run_id,
                "greet".to_string(),
                "q".to_string(),
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let bad_event = HistoryEvent {
            namespace_id: ns,
            workflow_id: "wf-3".to_string(),
            run_id,
            event_id: 4,
            event_type: "SomeEvent".to_string(),
            event_timestamp: Utc::now(),
            task_id: None,
            version: 1,
            event_data: serde_json::Value::Null,
        };
        let err = service
            .append_events(ns, "wf-3", run_id, vec![bad_event])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::HistoryEventError(_)));
        assert!(service.validate_history(ns, "wf-3", run_id).await.unwrap());
    }
}

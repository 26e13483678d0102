//! Workflow execution repository: `create`, `get`, `getCurrent`, optimistic
//! concurrency `update`, `updateWithNextEventId`, `list`, `terminate`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{WorkflowExecution, WorkflowExecutionState};

use super::{decode_offset_token, encode_offset_token, PageToken};

pub struct ExecutionPage {
    pub items: Vec<WorkflowExecution>,
    pub next_page_token: Option<PageToken>,
}

#[async_trait]
pub trait WorkflowExecutionRepository: Send + Sync {
    async fn create(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, OrchestratorError>;

    async fn get(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowExecution, OrchestratorError>;

    /// Most recent run (by `started_at`) for a `workflow_id`.
    async fn get_current(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<WorkflowExecution, OrchestratorError>;

    /// Fails with `ConcurrencyConflict` if the persisted `version` does not
    /// equal `expected_version`. On success, the persisted version becomes
    /// `expected_version + 1`.
    async fn update(
        &self,
        execution: WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution, OrchestratorError>;

    /// As `update`, but also advances `next_event_id` atomically — used by
    /// the history service when an update is paired with an event append.
    async fn update_with_next_event_id(
        &self,
        execution: WorkflowExecution,
        expected_version: i64,
        next_event_id: i64,
    ) -> Result<WorkflowExecution, OrchestratorError>;

    async fn list(
        &self,
        namespace_id: Uuid,
        state: Option<WorkflowExecutionState>,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<ExecutionPage, OrchestratorError>;

    async fn terminate(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, OrchestratorError>;
}

fn validate_transition(
    current: &WorkflowExecution,
    next: &WorkflowExecution,
) -> Result<(), OrchestratorError> {
    if current.state.is_terminal() {
        return Err(OrchestratorError::InvalidWorkflowState(format!(
            "execution {}/{} is already in terminal state {:?}",
            current.workflow_id, current.run_id, current.state
        )));
    }
    if next.state.is_terminal() && (next.completed_at.is_none() || next.completion_event_id.is_none())
    {
        return Err(OrchestratorError::InvalidRequest(
            "terminal transitions must set completed_at and completion_event_id".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresExecutionRepository {
    pool: PgPool,
}

impl PostgresExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowExecutionRepository for PostgresExecutionRepository {
    #[instrument(skip(self, execution))]
    async fn create(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let state = serde_json::to_value(execution.state)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        let timeouts = serde_json::to_value(execution.timeouts)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;

        let existing = sqlx::query(
            "SELECT 1 FROM workflow_executions WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3",
        )
        .bind(execution.namespace_id)
        .bind(&execution.workflow_id)
        .bind(execution.run_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(OrchestratorError::AlreadyExists(format!(
                "execution {}/{} already exists",
                execution.workflow_id, execution.run_id
            )));
        }

        sqlx::query(
            "INSERT INTO workflow_executions (namespace_id, workflow_id, run_id, workflow_type, \
             task_queue, workflow_state, execution_state, next_event_id, last_processed_event_id, \
             timeouts, retry_policy, cron_schedule, parent_workflow_id, parent_run_id, \
             initiated_id, completion_event_id, memo, search_attributes, started_at, completed_at, \
             last_updated_at, shard_id, version) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,\
             $13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)",
        )
        .bind(execution.namespace_id)
        .bind(&execution.workflow_id)
        .bind(execution.run_id)
        .bind(&execution.workflow_type)
        .bind(&execution.task_queue)
        .bind(state)
        .bind(&execution.execution_state)
        .bind(execution.next_event_id)
        .bind(execution.last_processed_event_id)
        .bind(timeouts)
        .bind(&execution.retry_policy)
        .bind(&execution.cron_schedule)
        .bind(&execution.parent_workflow_id)
        .bind(execution.parent_run_id)
        .bind(execution.initiated_id)
        .bind(execution.completion_event_id)
        .bind(&execution.memo)
        .bind(&execution.search_attributes)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.last_updated_at)
        .bind(execution.shard_id as i32)
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        debug!(workflow_id = %execution.workflow_id, run_id = %execution.run_id, "execution created");
        Ok(execution)
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("execution {workflow_id}/{run_id}")))?;
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn get_current(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE namespace_id = $1 AND workflow_id = $2 \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("execution {workflow_id}")))?;
        row.try_into()
    }

    #[instrument(skip(self, execution))]
    async fn update(
        &self,
        mut execution: WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let current_row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workflow_executions WHERE namespace_id = $1 AND workflow_id = $2 \
             AND run_id = $3 FOR UPDATE",
        )
        .bind(execution.namespace_id)
        .bind(&execution.workflow_id)
        .bind(execution.run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!(
            "execution {}/{}",
            execution.workflow_id, execution.run_id
        )))?;

        if current_row.version != expected_version {
            return Err(OrchestratorError::ConcurrencyConflict {
                expected: expected_version,
                actual: current_row.version,
            });
        }
        let current: WorkflowExecution = current_row.try_into()?;
        validate_transition(&current, &execution)?;

        execution.version = expected_version + 1;
        execution.last_updated_at = Utc::now();

        let state = serde_json::to_value(execution.state)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        let timeouts = serde_json::to_value(execution.timeouts)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;

        sqlx::query(
            "UPDATE workflow_executions SET workflow_state = $4, execution_state = $5, \
             next_event_id = $6, last_processed_event_id = $7, timeouts = $8, \
             completion_event_id = $9, completed_at = $10, last_updated_at = $11, version = $12 \
             WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3",
        )
        .bind(execution.namespace_id)
        .bind(&execution.workflow_id)
        .bind(execution.run_id)
        .bind(state)
        .bind(&execution.execution_state)
        .bind(execution.next_event_id)
        .bind(execution.last_processed_event_id)
        .bind(timeouts)
        .bind(execution.completion_event_id)
        .bind(execution.completed_at)
        .bind(execution.last_updated_at)
        .bind(execution.version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(execution)
    }

    #[instrument(skip(self, execution))]
    async fn update_with_next_event_id(
        &self,
        mut execution: WorkflowExecution,
        expected_version: i64,
        next_event_id: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        execution.next_event_id = next_event_id;
        self.update(execution, expected_version).await
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        namespace_id: Uuid,
        state: Option<WorkflowExecutionState>,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<ExecutionPage, OrchestratorError> {
        let offset = decode_offset_token(&page_token) as i64;
        let limit = page_size.clamp(1, 500) as i64;

        let rows = if let Some(state) = state {
            let state_json = serde_json::to_value(state)
                .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
            sqlx::query_as::<_, ExecutionRow>(
                "SELECT * FROM workflow_executions WHERE namespace_id = $1 AND workflow_state = $2 \
                 ORDER BY started_at DESC LIMIT $3 OFFSET $4",
            )
            .bind(namespace_id)
            .bind(state_json)
            .bind(limit + 1)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, ExecutionRow>(
                "SELECT * FROM workflow_executions WHERE namespace_id = $1 \
                 ORDER BY started_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(namespace_id)
            .bind(limit + 1)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?
        };

        let has_more = rows.len() as i64 > limit;
        let items: Result<Vec<WorkflowExecution>, OrchestratorError> = rows
            .into_iter()
            .take(limit as usize)
            .map(TryInto::try_into)
            .collect();
        let items = items?;

        Ok(ExecutionPage {
            next_page_token: has_more.then(|| encode_offset_token(offset as u64 + limit as u64)),
            items,
        })
    }

    #[instrument(skip(self))]
    async fn terminate(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let execution = self.get(namespace_id, workflow_id, run_id).await?;
        if execution.state.is_terminal() {
            return Err(OrchestratorError::InvalidWorkflowState(format!(
                "execution {workflow_id}/{run_id} is already terminal"
            )));
        }
        let expected_version = execution.version;
        let mut next = execution;
        next.state = WorkflowExecutionState::Terminated;
        next.completed_at = Some(Utc::now());
        next.completion_event_id = Some(next.next_event_id);
        next.execution_state =
            serde_json::json!({ "termination_reason": reason });
        self.update(next, expected_version).await
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    namespace_id: Uuid,
    workflow_id: String,
    run_id: Uuid,
    workflow_type: String,
    task_queue: String,
    workflow_state: serde_json::Value,
    execution_state: serde_json::Value,
    next_event_id: i64,
    last_processed_event_id: i64,
    timeouts: serde_json::Value,
    retry_policy: Option<serde_json::Value>,
    cron_schedule: Option<String>,
    parent_workflow_id: Option<String>,
    parent_run_id: Option<Uuid>,
    initiated_id: Option<i64>,
    completion_event_id: Option<i64>,
    memo: Option<serde_json::Value>,
    search_attributes: Option<serde_json::Value>,
    started_at: chrono::DateTime<Utc>,
    completed_at: Option<chrono::DateTime<Utc>>,
    last_updated_at: chrono::DateTime<Utc>,
    shard_id: i32,
    version: i64,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = OrchestratorError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let state = serde_json::from_value(row.workflow_state)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        let timeouts = serde_json::from_value(row.timeouts)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        Ok(WorkflowExecution {
            namespace_id: row.namespace_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            workflow_type: row.workflow_type,
            task_queue: row.task_queue,
            state,
            execution_state: row.execution_state,
            next_event_id: row.next_event_id,
            last_processed_event_id: row.last_processed_event_id,
            timeouts,
            retry_policy: row.retry_policy,
            cron_schedule: row.cron_schedule,
            parent_workflow_id: row.parent_workflow_id,
            parent_run_id: row.parent_run_id,
            initiated_id: row.initiated_id,
            completion_event_id: row.completion_event_id,
            memo: row.memo,
            search_attributes: row.search_attributes,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_updated_at: row.last_updated_at,
            shard_id: row.shard_id as u32,
            version: row.version,
        })
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

type ExecutionKey = (Uuid, String, Uuid);

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<ExecutionKey, WorkflowExecution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowExecutionRepository for InMemoryExecutionRepository {
    async fn create(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let key = (
            execution.namespace_id,
            execution.workflow_id.clone(),
            execution.run_id,
        );
        let mut map = self.executions.write();
        if map.contains_key(&key) {
            return Err(OrchestratorError::AlreadyExists(format!(
                "execution {}/{} already exists",
                execution.workflow_id, execution.run_id
            )));
        }
        map.insert(key, execution.clone());
        Ok(execution)
    }

    async fn get(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.executions
            .read()
            .get(&(namespace_id, workflow_id.to_string(), run_id))
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {workflow_id}/{run_id}")))
    }

    async fn get_current(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        self.executions
            .read()
            .values()
            .filter(|e| e.namespace_id == namespace_id && e.workflow_id == workflow_id)
            .max_by_key(|e| e.started_at)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {workflow_id}")))
    }

    async fn update(
        &self,
        mut execution: WorkflowExecution,
        expected_version: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let key = (
            execution.namespace_id,
            execution.workflow_id.clone(),
            execution.run_id,
        );
        let mut map = self.executions.write();
        let current = map
            .get(&key)
            .ok_or_else(|| OrchestratorError::NotFound(format!(
                "execution {}/{}",
                execution.workflow_id, execution.run_id
            )))?;

        if current.version != expected_version {
            return Err(OrchestratorError::ConcurrencyConflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        validate_transition(current, &execution)?;

        execution.version = expected_version + 1;
        execution.last_updated_at = Utc::now();
        map.insert(key, execution.clone());
        Ok(execution)
    }

    async fn update_with_next_event_id(
        &self,
        mut execution: WorkflowExecution,
        expected_version: i64,
        next_event_id: i64,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        execution.next_event_id = next_event_id;
        self.update(execution, expected_version).await
    }

    async fn list(
        &self,
        namespace_id: Uuid,
        state: Option<WorkflowExecutionState>,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<ExecutionPage, OrchestratorError> {
        let offset = decode_offset_token(&page_token) as usize;
        let limit = page_size.clamp(1, 500) as usize;

        let mut all: Vec<WorkflowExecution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.namespace_id == namespace_id)
            .filter(|e| state.is_none_or(|s| e.state == s))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let items: Vec<WorkflowExecution> = all.iter().skip(offset).take(limit).cloned().collect();
        let has_more = all.len() > offset + items.len();

        Ok(ExecutionPage {
            next_page_token: has_more.then(|| encode_offset_token((offset + limit) as u64)),
            items,
        })
    }

    async fn terminate(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let execution = self.get(namespace_id, workflow_id, run_id).await?;
        if execution.state.is_terminal() {
            return Err(OrchestratorError::InvalidWorkflowState(format!(
                "execution {workflow_id}/{run_id} is already terminal"
            )));
        }
        let expected_version = execution.version;
        let mut next = execution;
        next.state = WorkflowExecutionState::Terminated;
        next.completed_at = Some(Utc::now());
        next.completion_event_id = Some(next.next_event_id);
        next.execution_state = serde_json::json!({ "termination_reason": reason });
        self.update(next, expected_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_execution() -> WorkflowExecution {
        WorkflowExecution::new_started(Uuid::now_v7(), "wf-1", Uuid::now_v7(), "greet", "q", 0)
    }

    #[tokio::test]
    async fn create_then_get() {
        let repo = InMemoryExecutionRepository::new();
        let exec = new_execution();
        repo.create(exec.clone()).await.unwrap();

        let fetched = repo.get(exec.namespace_id, &exec.workflow_id, exec.run_id).await.unwrap();
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn concurrent_update_one_wins() {
        let repo = InMemoryExecutionRepository::new();
        let exec = new_execution();
        repo.create(exec.clone()).await.unwrap();

        let mut a = exec.clone();
        a.state = WorkflowExecutionState::Completed;
        a.completed_at = Some(Utc::now());
        a.completion_event_id = Some(2);

        let mut b = exec.clone();
        b.state = WorkflowExecutionState::Failed;
        b.completed_at = Some(Utc::now());
        b.completion_event_id = Some(2);

        let first = repo.update(a, 1).await;
        let second = repo.update(b, 1).await;

        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            OrchestratorError::ConcurrencyConflict { .. }
        ));
    }

    #[tokio::test]
    async fn terminal_update_rejected() {
        let repo = InMemoryExecutionRepository::new();
        let exec = new_execution();
        repo.create(exec.clone()).await.unwrap();

        let mut completed = exec.clone();
        completed.state = WorkflowExecutionState::Completed;
        completed.completed_at = Some(Utc::now());
        completed.completion_event_id = Some(2);
        let completed = repo.update(completed, 1).await.unwrap();

        let mut again = completed.clone();
        again.state = WorkflowExecutionState::Failed;
        again.completed_at = Some(Utc::now());
        again.completion_event_id = Some(3);
        let err = repo.update(again, completed.version).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflowState(_)));
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let repo = InMemoryExecutionRepository::new();
        let ns = Uuid::now_v7();
        for i in 0..3 {
            let exec = WorkflowExecution::new_started(ns, format!("wf-{i}"), Uuid::now_v7(), "t", "q", 0);
            repo.create(exec).await.unwrap();
        }
        let page = repo
            .list(ns, Some(WorkflowExecutionState::Running), 10, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);

        let page = repo
            .list(ns, Some(WorkflowExecutionState::Completed), 10, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 0);
    }
}

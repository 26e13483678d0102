//! The data model: namespaces, shards, workflow executions, history events,
//! task queue items/leases, and visibility records.
//!
//! All entities live inside a namespace (multi-tenant isolation; keys
//! include `namespace_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a [`Namespace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStatus {
    Active,
    Deprecated,
    Deleted,
}

/// Multi-tenant isolation boundary. Soft-deleted by transitioning `status`
/// to `Deleted`; lookups by name must exclude deleted rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub namespace_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Option<String>,
    pub retention_days: i32,
    pub history_archival_enabled: bool,
    pub visibility_archival_enabled: bool,
    pub status: NamespaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            namespace_id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            owner_id: None,
            retention_days: 30,
            history_archival_enabled: false,
            visibility_archival_enabled: false,
            status: NamespaceStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One of `S` partitions of the 32-bit workflowId hash space, exclusively
/// owned by at most one process at a time via a lease.
///
/// Invariant: `owner_identity.is_some() <=> lease_expires_at.is_some()`. A
/// lease with `lease_expires_at < now` is equivalent to unowned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: u32,
    pub owner_identity: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub hash_range_start: u64,
    pub hash_range_end: u64,
}

impl Shard {
    /// True if there is no current non-expired owner.
    pub fn is_unowned(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            None => true,
            Some(expires) => expires < now,
        }
    }
}

/// The mutable state of a single run of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutionState {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    ContinuedAsNew,
    TimedOut,
}

impl WorkflowExecutionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkflowExecutionState::Running)
    }
}

/// Timeout configuration carried on an execution (seconds).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionTimeouts {
    pub workflow_timeout_seconds: Option<i64>,
    pub run_timeout_seconds: Option<i64>,
    pub task_timeout_seconds: Option<i64>,
}

impl Default for ExecutionTimeouts {
    fn default() -> Self {
        Self {
            workflow_timeout_seconds: None,
            run_timeout_seconds: None,
            task_timeout_seconds: Some(10),
        }
    }
}

/// Mutable workflow execution state, optimistic-concurrency controlled via
/// `version`.
///
/// Invariants: terminal states require `completed_at` and
/// `completion_event_id` set; `version` strictly increases on every
/// successful mutation; `shard_id = shard_id(workflow_id, S)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub namespace_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub state: WorkflowExecutionState,
    pub execution_state: Value,
    pub next_event_id: i64,
    pub last_processed_event_id: i64,
    pub timeouts: ExecutionTimeouts,
    pub retry_policy: Option<Value>,
    pub cron_schedule: Option<String>,
    pub parent_workflow_id: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub initiated_id: Option<i64>,
    pub completion_event_id: Option<i64>,
    pub memo: Option<Value>,
    pub search_attributes: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub shard_id: u32,
    pub version: i64,
}

impl WorkflowExecution {
    /// Construct the initial `version = 1`, `state = Running` row created by
    /// `StartWorkflow`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_started(
        namespace_id: Uuid,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        shard_id: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            namespace_id,
            workflow_id: workflow_id.into(),
            run_id,
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            state: WorkflowExecutionState::Running,
            execution_state: Value::Null,
            next_event_id: 2,
            last_processed_event_id: 1,
            timeouts: ExecutionTimeouts::default(),
            retry_policy: None,
            cron_schedule: None,
            parent_workflow_id: None,
            parent_run_id: None,
            initiated_id: None,
            completion_event_id: None,
            memo: None,
            search_attributes: None,
            started_at: now,
            completed_at: None,
            last_updated_at: now,
            shard_id,
            version: 1,
        }
    }
}

/// An immutable, per-run, sequentially-numbered record of a state
/// transition or external signal.
///
/// Invariants: for any run, `event_id`s form a contiguous sequence `1..N`;
/// events are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub namespace_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub event_id: i64,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub task_id: Option<i64>,
    pub version: i64,
    pub event_data: Value,
}

/// The type of queue a [`TaskQueueItem`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueType {
    Workflow,
    Activity,
}

/// One item of work sitting in a task queue partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueItem {
    pub namespace_id: Uuid,
    pub task_queue_name: String,
    pub task_queue_type: TaskQueueType,
    pub task_id: i64,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub expiry_at: Option<DateTime<Utc>>,
    pub task_data: Value,
    pub partition_hash: u32,
}

/// A time-bounded ownership record over a [`TaskQueueItem`], renewed by
/// heartbeat.
///
/// Invariant: at most one non-expired lease per
/// `(namespace_id, task_queue_name, task_queue_type, task_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLease {
    pub lease_id: Uuid,
    pub namespace_id: Uuid,
    pub task_queue_name: String,
    pub task_queue_type: TaskQueueType,
    pub task_id: i64,
    pub worker_identity: String,
    pub leased_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub attempt_count: i32,
}

impl TaskLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }
}

/// Eventually-consistent projection of an execution, keyed by
/// `(namespace_id, workflow_id, run_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityRecord {
    pub namespace_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowExecutionState,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub history_length: i64,
    pub memo: Option<Value>,
    pub search_attributes: Option<Value>,
    pub parent_workflow_id: Option<String>,
    pub tags: std::collections::BTreeMap<String, String>,
}

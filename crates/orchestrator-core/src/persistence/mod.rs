//! Persistence layer: repository contracts for namespaces, shards, workflow
//! executions, history, task queues, and visibility.
//!
//! Each repository is a pure-data contract (no side effects beyond the
//! described operation) with two implementations: a `Postgres*` backend
//! using raw `sqlx` queries with explicit transactions and row-level
//! locking, and an `InMemory*` backend used for tests and standalone
//! operation.

mod execution;
mod history;
mod namespace;
mod shard;
mod task_queue;
mod visibility;

pub use execution::{
    InMemoryExecutionRepository, PostgresExecutionRepository, WorkflowExecutionRepository,
};
pub use history::{HistoryRepository, InMemoryHistoryRepository, PostgresHistoryRepository};
pub use namespace::{InMemoryNamespaceRepository, NamespaceRepository, PostgresNamespaceRepository};
pub use shard::{InMemoryShardRepository, PostgresShardRepository, ShardRepository};
pub use task_queue::{
    InMemoryTaskQueueRepository, PostgresTaskQueueRepository, QueueStats, TaskQueueRepository,
    DEFAULT_REQUEUE_DELAY,
};
pub use visibility::{
    InMemoryVisibilityRepository, ListRequest, PostgresVisibilityRepository, VisibilityFilter,
    VisibilityQuery, VisibilityRepository,
};

/// An opaque page token used by list/search operations.
///
/// Tokens in this crate encode a non-negative integer offset. They are
/// opaque to callers: treat them as a string, never parse their contents.
pub type PageToken = String;

pub(crate) fn encode_offset_token(offset: u64) -> PageToken {
    offset.to_string()
}

pub(crate) fn decode_offset_token(token: &Option<PageToken>) -> u64 {
    token
        .as_ref()
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(0)
}

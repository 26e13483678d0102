//! # Orchestrator Core
//!
//! A Temporal-compatible durable workflow orchestration core: shard-owned
//! history service, leased task matching, a deterministic workflow runtime
//! contract, and an eventually-consistent visibility index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ShardManager                           │
//! │   (consistent-hash shard ownership, lease + heartbeat loop)  │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!           ┌──────────────────┼──────────────────┐
//!           ▼                                      ▼
//! ┌───────────────────────┐            ┌───────────────────────┐
//! │     HistoryService     │            │     MatchingService    │
//! │ (append-only event log │            │ (leased task queue,    │
//! │  + execution state)    │            │  FIFO, at-least-once)  │
//! └───────────────────────┘            └───────────────────────┘
//!           │                                      │
//!           └──────────────────┬───────────────────┘
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                            │
//! │  (poll -> resolve workflowType -> execute -> append/complete) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use orchestrator_core::prelude::*;
//!
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl Workflow for Greet {
//!     const WORKFLOW_TYPE: &'static str = "greet";
//!     type Input = GreetInput;
//!     type Output = GreetOutput;
//!
//!     async fn execute(&self, ctx: &Context, input: Self::Input) -> WorkflowResult<Self::Output> {
//!         Ok(GreetOutput { message: format!("hello, {}", input.name) })
//!     }
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod history_service;
pub mod matching;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod runtime;
pub mod shard_manager;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
    pub use crate::engine::WorkflowRegistry;
    pub use crate::error::OrchestratorError;
    pub use crate::history_service::HistoryService;
    pub use crate::matching::MatchingService;
    pub use crate::model::{
        HistoryEvent, Namespace, Shard, TaskLease, TaskQueueItem, TaskQueueType, VisibilityRecord,
        WorkflowExecution, WorkflowExecutionState,
    };
    pub use crate::reliability::{RetryPolicy, TimeoutConfig, TimeoutManager};
    pub use crate::runtime::{Context, Workflow, WorkflowResult};
    pub use crate::shard_manager::{ShardManager, ShardManagerConfig};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::WorkflowRegistry;
pub use error::OrchestratorError;
pub use history_service::HistoryService;
pub use matching::MatchingService;
pub use runtime::{Context, Workflow, WorkflowResult};
pub use shard_manager::{ShardManager, ShardManagerConfig};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};

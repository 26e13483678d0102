//! The narrowed `Workflow` trait: a single behavior contract
//! (`execute(ctx, input) -> Result<output>`) rather than a multi-callback,
//! inheritance-shaped interface.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::OrchestratorError;

use super::context::Context;

pub type WorkflowResult<T> = Result<T, OrchestratorError>;

/// A deterministic function over the run's history plus its initial input.
/// Implementations MUST produce identical outputs and identical captured
/// effect values on every replay of the same history.
///
/// Forbidden inside `execute`: direct wall-clock reads (use
/// `ctx.clock_now()`), RNG, direct I/O, unordered iteration over
/// non-sorted collections, and platform-sensitive floating point.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// The registry key this workflow is resolved by (`workflowType`).
    const WORKFLOW_TYPE: &'static str;

    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn execute(&self, ctx: &Context, input: Self::Input) -> WorkflowResult<Self::Output>;
}

//! Workflow registry: maps `workflowType -> (decoder, executor)`, populated
//! at process startup and consulted by the dispatcher on every poll.
//!
//! A boxed closure keyed by type name erases the concrete
//! `Workflow::Input`/`Output` behind a trait object, so decoding raw bytes
//! and invoking `execute(ctx, input) -> Result<output>` can happen without
//! the dispatcher ever naming the concrete workflow type.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::runtime::{Context, Workflow};

/// Type-erased workflow invocation. Implemented automatically for every
/// concrete `W: Workflow` via [`WorkflowAdapter`]; callers never implement
/// this directly.
#[async_trait]
trait AnyWorkflow: Send + Sync {
    async fn execute_erased(&self, ctx: &Context, input: Value) -> Result<Value, OrchestratorError>;
}

struct WorkflowAdapter<W>(W);

#[async_trait]
impl<W: Workflow> AnyWorkflow for WorkflowAdapter<W> {
    async fn execute_erased(&self, ctx: &Context, input: Value) -> Result<Value, OrchestratorError> {
        let typed_input: W::Input = serde_json::from_value(input).map_err(|e| {
            OrchestratorError::InvalidRequest(format!(
                "could not decode input for workflow type {}: {e}",
                W::WORKFLOW_TYPE
            ))
        })?;
        let output = self.0.execute(ctx, typed_input).await?;
        serde_json::to_value(output).map_err(|e| {
            OrchestratorError::WorkflowExecutionFailed(format!(
                "could not encode output for workflow type {}: {e}",
                W::WORKFLOW_TYPE
            ))
        })
    }
}

/// A registry entry: the boxed, type-erased workflow plus its declared type
/// name, set up once at startup and looked up by the dispatcher on every
/// poll.
pub struct WorkflowRegistry {
    entries: HashMap<String, Box<dyn AnyWorkflow>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a concrete workflow implementation under its
    /// `Workflow::WORKFLOW_TYPE` key. Registering the same type twice
    /// silently replaces the earlier registration — startup wiring code is
    /// expected to register each type exactly once.
    pub fn register<W: Workflow + 'static>(&mut self, workflow: W) {
        self.entries
            .insert(W::WORKFLOW_TYPE.to_string(), Box::new(WorkflowAdapter(workflow)));
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.entries.contains_key(workflow_type)
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `input` per the registered workflow's `Input` type and invoke
    /// it, returning the JSON-encoded output. Returns
    /// `WorkflowNotRegistered` if `workflow_type` has no entry.
    pub async fn dispatch(
        &self,
        workflow_type: &str,
        ctx: &Context,
        input: Value,
    ) -> Result<Value, OrchestratorError> {
        let entry = self
            .entries
            .get(workflow_type)
            .ok_or_else(|| OrchestratorError::WorkflowNotRegistered(workflow_type.to_string()))?;
        entry.execute_erased(ctx, input).await
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct GreetInput {
        name: String,
    }

    #[derive(Debug, Serialize)]
    struct GreetOutput {
        message: String,
    }

    struct Greet;

    #[async_trait]
    impl Workflow for Greet {
        const WORKFLOW_TYPE: &'static str = "greet";
        type Input = GreetInput;
        type Output = GreetOutput;

        async fn execute(
            &self,
            _ctx: &Context,
            input: Self::Input,
        ) -> Result<Self::Output, OrchestratorError> {
            Ok(GreetOutput {
                message: format!("hello, {}", input.name),
            })
        }
    }

    fn ctx() -> Context {
        Context::new("ns", "wf-1", Uuid::now_v7(), "q", Utc::now(), 0)
    }

    #[tokio::test]
    async fn registers_and_dispatches() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Greet);
        assert!(registry.contains("greet"));

        let output = registry
            .dispatch("greet", &ctx(), serde_json::json!({"name": "alice"}))
            .await
            .unwrap();
        assert_eq!(output["message"], "hello, alice");
    }

    #[tokio::test]
    async fn unknown_type_is_not_registered_error() {
        let registry = WorkflowRegistry::new();
        let err = registry
            .dispatch("unknown", &ctx(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkflowNotRegistered(_)));
    }

    #[tokio::test]
    async fn malformed_input_is_invalid_request() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Greet);
        let err = registry
            .dispatch("greet", &ctx(), serde_json::json!({"wrong_field": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }
}

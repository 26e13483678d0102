//! Workflow type registry: resolves `workflowType -> (decoder, executor)`
//! for the dispatcher.

mod registry;

pub use registry::WorkflowRegistry;

//! The workflow runtime contract: the deterministic execution model
//! external workers must honor to be replay-safe.
//!
//! An explicit `Context` struct is threaded through a single narrow
//! `execute(ctx, input)` method rather than relying on ambient
//! thread-local-like state, so a workflow's dependencies are visible at its
//! call site and substitutable in tests.

mod context;
mod effect_store;
mod version_gate;
mod workflow;

pub use context::{Context, TimeProvider, SystemTimeProvider};
pub use effect_store::DeterministicEffectStore;
pub use version_gate::{VersionDecision, VersionGate};
pub use workflow::{Workflow, WorkflowResult};

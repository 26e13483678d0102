//! Version gate: pins a backwards-incompatible workflow logic change the
//! first time a `changeId` is encountered and replays the same decision on
//! every subsequent execution of that run's history.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::OrchestratorError;

use super::context::Context;

/// The outcome of a `VersionGate::require` call: the version this run is
/// pinned to for a given `changeId`, plus whether it was just chosen
/// (`is_first_encounter`) or replayed from a prior decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionDecision {
    pub version: i32,
    pub is_first_encounter: bool,
}

/// Per-run record of version decisions, keyed by `changeId`. Replays return
/// the same decision without re-invoking `initial_provider`.
#[derive(Debug, Clone, Default)]
pub struct VersionGate {
    decisions: std::sync::Arc<RwLock<HashMap<String, i32>>>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(decisions: HashMap<String, i32>) -> Self {
        Self {
            decisions: std::sync::Arc::new(RwLock::new(decisions)),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, i32> {
        self.decisions.read().clone()
    }

    /// `initial_provider` is invoked exactly once per `change_id`, the first
    /// time it is encountered by this run, to pick the initial version;
    /// callers SHOULD default it to `min_version`. On replay, the
    /// previously recorded version is returned unconditionally. If a
    /// persisted version falls outside `[min_version, max_version]`,
    /// returns `InvalidWorkflowState` rather than silently clamping it.
    pub fn require(
        &self,
        ctx: &Context,
        change_id: &str,
        min_version: i32,
        max_version: i32,
        initial_provider: impl FnOnce() -> i32,
    ) -> Result<VersionDecision, OrchestratorError> {
        ctx.advance();

        if let Some(&version) = self.decisions.read().get(change_id) {
            return Self::validated(version, min_version, max_version, false);
        }

        let version = initial_provider();
        self.decisions
            .write()
            .insert(change_id.to_string(), version);
        Self::validated(version, min_version, max_version, true)
    }

    fn validated(
        version: i32,
        min_version: i32,
        max_version: i32,
        is_first_encounter: bool,
    ) -> Result<VersionDecision, OrchestratorError> {
        if version < min_version || version > max_version {
            return Err(OrchestratorError::InvalidWorkflowState(format!(
                "version_mismatch: recorded version {version} outside [{min_version}, {max_version}]"
            )));
        }
        Ok(VersionDecision {
            version,
            is_first_encounter,
        })
    }
}

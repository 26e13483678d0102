//! Per-task execution context, threaded explicitly through every workflow
//! invocation rather than held in ambient thread-local state: a
//! `parking_lot::RwLock`-guarded metadata map and a trait-object
//! `TimeProvider` so tests can substitute a deterministic clock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::effect_store::DeterministicEffectStore;
use super::version_gate::VersionGate;

/// Supplies the current time to workflow code. Workflow bodies MUST use
/// this instead of reading the wall clock directly, so that replay with a
/// recorded effect produces identical results.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The default provider, backed by the real wall clock. Only ever consulted
/// the first time a given effect is captured; replays reuse the recorded
/// value regardless of what this returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Execution context scoped to one workflow task. Constructed fresh by the
/// dispatcher for every poll/replay and passed by reference into
/// `Workflow::execute`.
pub struct Context {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub task_queue: String,
    pub started_at: DateTime<Utc>,
    /// Monotonically increasing counter, incremented once per decision the
    /// workflow makes (capture, version check, or scheduled action). Gives
    /// workflow code a deterministic ordinal independent of wall-clock time.
    logical_clock: std::sync::atomic::AtomicI64,
    /// Number of times this run has been replayed from history, starting at
    /// 0 for a fresh execution. Workflow code may use this for diagnostics
    /// but MUST NOT branch on it (doing so would break determinism).
    pub replay_count: u32,
    metadata: HashMap<String, String>,
    time_provider: Arc<dyn TimeProvider>,
    effects: DeterministicEffectStore,
    versions: VersionGate,
}

impl Context {
    pub fn new(
        namespace: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        task_queue: impl Into<String>,
        started_at: DateTime<Utc>,
        replay_count: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            workflow_id: workflow_id.into(),
            run_id,
            task_queue: task_queue.into(),
            started_at,
            logical_clock: std::sync::atomic::AtomicI64::new(0),
            replay_count,
            metadata: HashMap::new(),
            time_provider: Arc::new(SystemTimeProvider),
            effects: DeterministicEffectStore::new(),
            versions: VersionGate::new(),
        }
    }

    /// Swap in a custom clock (e.g. a fixed-instant fake for tests). Must be
    /// called before any `capture`/`require_version` call that reads time.
    pub fn with_time_provider(mut self, provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = provider;
        self
    }

    /// Seed the effect store from previously-recorded values (replay path).
    /// The dispatcher calls this when rehydrating a `Context` from history
    /// before re-invoking the workflow.
    pub fn with_recorded_effects(mut self, effects: DeterministicEffectStore) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_recorded_versions(mut self, versions: VersionGate) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn logical_clock(&self) -> i64 {
        self.logical_clock.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn tick(&self) -> i64 {
        self.logical_clock
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Current time per the configured `TimeProvider`. Exposed for
    /// `DeterministicEffectStore` producers that need "now" without a
    /// direct wall-clock read.
    pub fn clock_now(&self) -> DateTime<Utc> {
        self.time_provider.now()
    }

    pub fn effects(&self) -> &DeterministicEffectStore {
        &self.effects
    }

    pub fn versions(&self) -> &VersionGate {
        &self.versions
    }

    /// Record a logical-clock tick and return its ordinal; used by
    /// `capture`/`require_version` free functions so every non-deterministic
    /// decision point advances the clock exactly once, replay or not.
    pub(crate) fn advance(&self) -> i64 {
        self.tick()
    }

    /// Consumes the context, returning the effect store and version gate so
    /// the dispatcher can persist their contents as history events.
    pub fn into_recorded_state(self) -> (DeterministicEffectStore, VersionGate) {
        (self.effects, self.versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_clock_advances_monotonically() {
        let ctx = Context::new("ns", "wf-1", Uuid::now_v7(), "q", Utc::now(), 0);
        assert_eq!(ctx.advance(), 0);
        assert_eq!(ctx.advance(), 1);
        assert_eq!(ctx.logical_clock(), 2);
    }

    #[test]
    fn custom_time_provider_overrides_default() {
        struct Fixed(DateTime<Utc>);
        impl TimeProvider for Fixed {
            fn now(&self) -> DateTime<Utc> {
                self.0
            }
        }
        let fixed = Utc::now() - chrono::Duration::days(1);
        let ctx = Context::new("ns", "wf-1", Uuid::now_v7(), "q", Utc::now(), 0)
            .with_time_provider(Arc::new(Fixed(fixed)));
        assert_eq!(ctx.clock_now(), fixed);
    }
}

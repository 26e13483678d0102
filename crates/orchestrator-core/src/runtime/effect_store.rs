//! Content-addressed, per-run effect store.
//!
//! `capture_async` is the sole escape hatch for non-determinism inside a
//! workflow body: a producer runs at most once per `effect_id` across the
//! lifetime of a run, and the recorded result (success or failure) is
//! replayed verbatim on every subsequent invocation of the same history.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;

use super::context::Context;

/// One recorded effect: either the serialized success value or a tagged
/// failure message, keyed by `effect_id`. Stored as `Value` so the whole
/// map round-trips through a single `HistoryEvent.event_data` JSON column.
#[derive(Debug, Clone, Default)]
pub struct DeterministicEffectStore {
    recorded: std::sync::Arc<RwLock<HashMap<String, Result<Value, String>>>>,
}

impl DeterministicEffectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from a previously persisted snapshot (replay path).
    pub fn from_snapshot(recorded: HashMap<String, Result<Value, String>>) -> Self {
        Self {
            recorded: std::sync::Arc::new(RwLock::new(recorded)),
        }
    }

    /// A serializable snapshot of everything captured so far, suitable for
    /// persisting as a `HistoryEvent.event_data` payload.
    pub fn snapshot(&self) -> HashMap<String, Result<Value, String>> {
        self.recorded.read().clone()
    }

    /// Returns the previously recorded value for `effect_id` if present;
    /// otherwise runs `producer`, persists the outcome (success or tagged
    /// error), and returns it. `producer` is permitted to be
    /// non-deterministic (RNG, wall clock, I/O) — only the stored result is
    /// authoritative across replays.
    pub async fn capture_async<T, F, Fut>(
        &self,
        ctx: &Context,
        effect_id: &str,
        producer: F,
    ) -> Result<T, OrchestratorError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        ctx.advance();

        if let Some(recorded) = self.recorded.read().get(effect_id).cloned() {
            return match recorded {
                Ok(value) => serde_json::from_value(value).map_err(|e| {
                    OrchestratorError::InvalidRequest(format!(
                        "effect {effect_id} could not be deserialized: {e}"
                    ))
                }),
                Err(message) => Err(OrchestratorError::WorkflowExecutionFailed(message)),
            };
        }

        let outcome = producer().await;
        let to_store = match &outcome {
            Ok(value) => {
                let json = serde_json::to_value(value).map_err(|e| {
                    OrchestratorError::InvalidRequest(format!(
                        "effect {effect_id} could not be serialized: {e}"
                    ))
                })?;
                Ok(json)
            }
            Err(e) => Err(e.to_string()),
        };
        self.recorded
            .write()
            .insert(effect_id.to_string(), to_store);
        outcome
    }

    pub fn contains(&self, effect_id: &str) -> bool {
        self.recorded.read().contains_key(effect_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn ctx() -> Context {
        Context::new("ns", "wf-1", Uuid::now_v7(), "q", Utc::now(), 0)
    }

    #[tokio::test]
    async fn capture_runs_producer_once_then_replays() {
        let store = DeterministicEffectStore::new();
        let ctx = ctx();
        let calls = AtomicU32::new(0);

        let first: i64 = store
            .capture_async(&ctx, "now", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        let second: i64 = store
            .capture_async(&ctx, "now", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .await
            .unwrap();

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_from_snapshot_is_deterministic() {
        let store = DeterministicEffectStore::new();
        let ctx = ctx();
        let _value: i64 = store
            .capture_async(&ctx, "t0", || async { Ok(7) })
            .await
            .unwrap();

        let replayed = DeterministicEffectStore::from_snapshot(store.snapshot());
        let ctx2 = ctx();
        let value: i64 = replayed
            .capture_async(&ctx2, "t0", || async {
                panic!("producer must not run on replay")
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn captured_failure_replays_as_failure() {
        let store = DeterministicEffectStore::new();
        let ctx = ctx();
        let result: Result<i64, OrchestratorError> = store
            .capture_async(&ctx, "bad", || async {
                Err(OrchestratorError::WorkflowExecutionFailed("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let ctx2 = ctx;
        let replay: Result<i64, OrchestratorError> = store
            .capture_async(&ctx2, "bad", || async {
                panic!("must not re-run")
            })
            .await;
        assert!(matches!(
            replay.unwrap_err(),
            OrchestratorError::WorkflowExecutionFailed(ref m) if m == "boom"
        ));
    }
}

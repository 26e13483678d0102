//! History repository: atomic event append with sequence-gap detection,
//! contiguous-range reads, and bulk archival.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::HistoryEvent;

use super::PageToken;

pub struct HistoryPage {
    pub events: Vec<HistoryEvent>,
    pub next_page_token: Option<PageToken>,
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Atomic: validates `events[0].event_id == last_event_id + 1` and
    /// intra-batch contiguity before inserting. Returns `HistoryEventError`
    /// on any gap or duplicate, leaving the log unchanged.
    async fn append_events(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        events: Vec<HistoryEvent>,
    ) -> Result<(), OrchestratorError>;

    /// Events in ascending `event_id` order. `max_events` is clamped to
    /// `[1, 5000]`.
    async fn get_history(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        from_event_id: i64,
        max_events: u32,
    ) -> Result<HistoryPage, OrchestratorError>;

    async fn get_event(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        event_id: i64,
    ) -> Result<HistoryEvent, OrchestratorError>;

    async fn get_event_count(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<i64, OrchestratorError>;

    /// `false` iff a gap exists anywhere in the run's event ids.
    async fn validate_sequence(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<bool, OrchestratorError>;

    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
        batch: u32,
    ) -> Result<u64, OrchestratorError>;
}

fn validate_batch(events: &[HistoryEvent], last_event_id: i64) -> Result<(), OrchestratorError> {
    if events.is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "append_events requires at least one event".to_string(),
        ));
    }
    if events[0].event_id != last_event_id + 1 {
        return Err(OrchestratorError::HistoryEventError(format!(
            "expected first event id {}, got {}",
            last_event_id + 1,
            events[0].event_id
        )));
    }
    for window in events.windows(2) {
        if window[1].event_id != window[0].event_id + 1 {
            return Err(OrchestratorError::HistoryEventError(format!(
                "non-contiguous batch: {} followed by {}",
                window[0].event_id, window[1].event_id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresHistoryRepository {
    pool: PgPool,
}

impl PostgresHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for PostgresHistoryRepository {
    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        events: Vec<HistoryEvent>,
    ) -> Result<(), OrchestratorError> {
        let mut tx = self.pool.begin().await?;

        let max_event_id: Option<i64> = sqlx::query_scalar(
            "SELECT max(event_id) FROM history_events WHERE namespace_id = $1 \
             AND workflow_id = $2 AND run_id = $3 FOR UPDATE",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

        validate_batch(&events, max_event_id.unwrap_or(0))?;

        for event in &events {
            let result = sqlx::query(
                "INSERT INTO history_events (namespace_id, workflow_id, run_id, event_id, \
                 event_type, event_timestamp, task_id, version, event_data) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
            )
            .bind(namespace_id)
            .bind(workflow_id)
            .bind(run_id)
            .bind(event.event_id)
            .bind(&event.event_type)
            .bind(event.event_timestamp)
            .bind(event.task_id)
            .bind(event.version)
            .bind(&event.event_data)
            .execute(&mut *tx)
            .await;

            if let Err(sqlx::Error::Database(db_err)) = &result {
                if db_err.is_unique_violation() {
                    return Err(OrchestratorError::HistoryEventError(format!(
                        "duplicate event id {}",
                        event.event_id
                    )));
                }
            }
            result?;
        }

        tx.commit().await?;
        debug!(workflow_id, %run_id, count = events.len(), "appended history events");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_history(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        from_event_id: i64,
        max_events: u32,
    ) -> Result<HistoryPage, OrchestratorError> {
        let limit = max_events.clamp(1, 5000) as i64;
        let rows = sqlx::query_as::<_, HistoryEventRow>(
            "SELECT * FROM history_events WHERE namespace_id = $1 AND workflow_id = $2 \
             AND run_id = $3 AND event_id >= $4 ORDER BY event_id ASC LIMIT $5",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(from_event_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let events: Vec<HistoryEvent> = rows.into_iter().map(Into::into).collect();
        let next_page_token = (events.len() as i64 == limit)
            .then(|| events.last().map(|e| (e.event_id + 1).to_string()))
            .flatten();

        Ok(HistoryPage {
            events,
            next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn get_event(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        event_id: i64,
    ) -> Result<HistoryEvent, OrchestratorError> {
        let row = sqlx::query_as::<_, HistoryEventRow>(
            "SELECT * FROM history_events WHERE namespace_id = $1 AND workflow_id = $2 \
             AND run_id = $3 AND event_id = $4",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("event {event_id}")))?;
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get_event_count(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<i64, OrchestratorError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM history_events WHERE namespace_id = $1 AND workflow_id = $2 \
             AND run_id = $3",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn validate_sequence(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<bool, OrchestratorError> {
        let gap_count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM (
                SELECT event_id, lead(event_id) OVER (ORDER BY event_id) AS next_id
                FROM history_events
                WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3
            ) t WHERE next_id IS NOT NULL AND next_id > event_id + 1",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(gap_count == 0)
    }

    #[instrument(skip(self))]
    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
        batch: u32,
    ) -> Result<u64, OrchestratorError> {
        let result = sqlx::query(
            "DELETE FROM history_events WHERE ctid IN (
                SELECT ctid FROM history_events
                WHERE namespace_id = $1 AND event_timestamp < $2
                LIMIT $3
            )",
        )
        .bind(namespace_id)
        .bind(threshold)
        .bind(batch as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct HistoryEventRow {
    namespace_id: Uuid,
    workflow_id: String,
    run_id: Uuid,
    event_id: i64,
    event_type: String,
    event_timestamp: chrono::DateTime<chrono::Utc>,
    task_id: Option<i64>,
    version: i64,
    event_data: serde_json::Value,
}

impl From<HistoryEventRow> for HistoryEvent {
    fn from(row: HistoryEventRow) -> Self {
        HistoryEvent {
            namespace_id: row.namespace_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            event_id: row.event_id,
            event_type: row.event_type,
            event_timestamp: row.event_timestamp,
            task_id: row.task_id,
            version: row.version,
            event_data: row.event_data,
        }
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

type RunKey = (Uuid, String, Uuid);

#[derive(Default)]
pub struct InMemoryHistoryRepository {
    events: RwLock<HashMap<RunKey, Vec<HistoryEvent>>>,
}

impl InMemoryHistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryRepository for InMemoryHistoryRepository {
    async fn append_events(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        events: Vec<HistoryEvent>,
    ) -> Result<(), OrchestratorError> {
        let key = (namespace_id, workflow_id.to_string(), run_id);
        let mut map = self.events.write();
        let run_events = map.entry(key).or_default();
        let last_event_id = run_events.last().map(|e| e.event_id).unwrap_or(0);
        validate_batch(&events, last_event_id)?;
        run_events.extend(events);
        Ok(())
    }

    async fn get_history(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        from_event_id: i64,
        max_events: u32,
    ) -> Result<HistoryPage, OrchestratorError> {
        let limit = max_events.clamp(1, 5000) as usize;
        let key = (namespace_id, workflow_id.to_string(), run_id);
        let map = self.events.read();
        let all = map.get(&key).cloned().unwrap_or_default();

        let events: Vec<HistoryEvent> = all
            .into_iter()
            .filter(|e| e.event_id >= from_event_id)
            .take(limit)
            .collect();
        let next_page_token = (events.len() == limit)
            .then(|| events.last().map(|e| (e.event_id + 1).to_string()))
            .flatten();

        Ok(HistoryPage {
            events,
            next_page_token,
        })
    }

    async fn get_event(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        event_id: i64,
    ) -> Result<HistoryEvent, OrchestratorError> {
        let key = (namespace_id, workflow_id.to_string(), run_id);
        self.events
            .read()
            .get(&key)
            .and_then(|events| events.iter().find(|e| e.event_id == event_id).cloned())
            .ok_or_else(|| OrchestratorError::NotFound(format!("event {event_id}")))
    }

    async fn get_event_count(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<i64, OrchestratorError> {
        let key = (namespace_id, workflow_id.to_string(), run_id);
        Ok(self.events.read().get(&key).map(|e| e.len() as i64).unwrap_or(0))
    }

    async fn validate_sequence(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<bool, OrchestratorError> {
        let key = (namespace_id, workflow_id.to_string(), run_id);
        let map = self.events.read();
        let Some(events) = map.get(&key) else {
            return Ok(true);
        };
        Ok(events
            .windows(2)
            .all(|w| w[1].event_id == w[0].event_id + 1))
    }

    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
        batch: u32,
    ) -> Result<u64, OrchestratorError> {
        let mut removed = 0u64;
        let mut map = self.events.write();
        for (key, events) in map.iter_mut() {
            if key.0 != namespace_id {
                continue;
            }
            let before = events.len();
            let mut to_remove = batch as usize - removed as usize;
            events.retain(|e| {
                if to_remove > 0 && e.event_timestamp < threshold {
                    to_remove -= 1;
                    false
                } else {
                    true
                }
            });
            removed += (before - events.len()) as u64;
            if removed as u32 >= batch {
                break;
            }
        }
        Ok(removed)
    }
}

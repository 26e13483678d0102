//! Visibility repository: a write-through, eventually-consistent projection
//! used for list/search, plus the minimal query grammar that drives it.
//!
//! Grammar: zero or more `Field = 'value'` conjuncts joined by `AND`, plus
//! an optional free-text term matching
//! `workflowId | workflowType | status | taskQueue`. Recognized fields are
//! `WorkflowType | WorkflowId | Status | TaskQueue | State`; unknown field
//! tokens fold into the free-text term. This is deliberately not a
//! Turing-complete query language.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{VisibilityRecord, WorkflowExecutionState};

use super::{decode_offset_token, encode_offset_token, PageToken};

/// A recognized field conjunct in the query grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityField {
    WorkflowType,
    WorkflowId,
    Status,
    TaskQueue,
}

/// One `Field = 'value'` conjunct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityFilter {
    pub field: VisibilityField,
    pub value: String,
}

/// A parsed query: the conjunction of recognized field filters plus an
/// optional free-text term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityQuery {
    pub filters: Vec<VisibilityFilter>,
    pub free_text: Option<String>,
}

impl VisibilityQuery {
    /// Parse the minimal grammar. Unrecognized field tokens are folded into
    /// the free-text term rather than rejected — the grammar degrades
    /// gracefully instead of erroring on unknown fields.
    pub fn parse(input: &str) -> Self {
        let mut filters = Vec::new();
        let mut free_text_terms = Vec::new();

        for clause in split_on_and(input) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            match parse_conjunct(clause) {
                Some(filter) => filters.push(filter),
                None => free_text_terms.push(clause.trim_matches('\'').trim_matches('"').to_string()),
            }
        }

        VisibilityQuery {
            filters,
            free_text: (!free_text_terms.is_empty()).then(|| free_text_terms.join(" ")),
        }
    }

    /// Does the given projection's fields match this query?
    pub fn matches(&self, record: &VisibilityRecord) -> bool {
        for filter in &self.filters {
            let matched = match filter.field {
                VisibilityField::WorkflowType => record.workflow_type == filter.value,
                VisibilityField::WorkflowId => record.workflow_id == filter.value,
                VisibilityField::Status => status_matches(record.status, &filter.value),
                VisibilityField::TaskQueue => record.task_queue == filter.value,
            };
            if !matched {
                return false;
            }
        }
        if let Some(term) = &self.free_text {
            let haystacks = [
                record.workflow_id.as_str(),
                record.workflow_type.as_str(),
                record.task_queue.as_str(),
                status_str(record.status),
            ];
            if !haystacks.iter().any(|h| h.eq_ignore_ascii_case(term)) {
                return false;
            }
        }
        true
    }
}

fn status_str(status: WorkflowExecutionState) -> &'static str {
    match status {
        WorkflowExecutionState::Running => "running",
        WorkflowExecutionState::Completed => "completed",
        WorkflowExecutionState::Failed => "failed",
        WorkflowExecutionState::Canceled => "canceled",
        WorkflowExecutionState::Terminated => "terminated",
        WorkflowExecutionState::ContinuedAsNew => "continued_as_new",
        WorkflowExecutionState::TimedOut => "timed_out",
    }
}

fn status_matches(status: WorkflowExecutionState, expected: &str) -> bool {
    status_str(status).eq_ignore_ascii_case(expected.trim_matches('\'').trim_matches('"'))
}

fn split_on_and(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = input;
    loop {
        if let Some(pos) = find_and(rest) {
            parts.push(&rest[..pos]);
            rest = &rest[pos + 5..];
        } else {
            parts.push(rest);
            break;
        }
    }
    parts
}

fn find_and(input: &str) -> Option<usize> {
    input.to_ascii_uppercase().find(" AND ")
}

fn parse_conjunct(clause: &str) -> Option<VisibilityFilter> {
    let eq_pos = clause.find('=')?;
    let field_token = clause[..eq_pos].trim();
    let value_token = clause[eq_pos + 1..].trim().trim_matches('\'').trim_matches('"');

    let field = match field_token.to_ascii_lowercase().as_str() {
        "workflowtype" => VisibilityField::WorkflowType,
        "workflowid" => VisibilityField::WorkflowId,
        "status" | "state" => VisibilityField::Status,
        "taskqueue" => VisibilityField::TaskQueue,
        _ => return None,
    };

    Some(VisibilityFilter {
        field,
        value: value_token.to_string(),
    })
}

pub struct ListRequest {
    pub namespace_id: Uuid,
    pub query: Option<String>,
    pub page_size: u32,
    pub page_token: Option<PageToken>,
}

pub struct VisibilityPage {
    pub items: Vec<VisibilityRecord>,
    pub next_page_token: Option<PageToken>,
}

#[async_trait]
pub trait VisibilityRepository: Send + Sync {
    /// Write-through upsert issued on every successful execution mutation.
    async fn upsert(&self, record: VisibilityRecord) -> Result<(), OrchestratorError>;

    async fn list(&self, request: ListRequest) -> Result<VisibilityPage, OrchestratorError>;

    async fn search(
        &self,
        namespace_id: Uuid,
        query: &str,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<VisibilityPage, OrchestratorError>;

    async fn count(
        &self,
        namespace_id: Uuid,
        query: Option<&str>,
    ) -> Result<i64, OrchestratorError>;

    async fn update_tags(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        tags: BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError>;

    async fn search_by_tags(
        &self,
        namespace_id: Uuid,
        tags: &BTreeMap<String, String>,
        match_all: bool,
    ) -> Result<Vec<VisibilityRecord>, OrchestratorError>;

    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, OrchestratorError>;

    async fn delete(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<(), OrchestratorError>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresVisibilityRepository {
    pool: PgPool,
}

impl PostgresVisibilityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VisibilityRepository for PostgresVisibilityRepository {
    #[instrument(skip(self, record))]
    async fn upsert(&self, record: VisibilityRecord) -> Result<(), OrchestratorError> {
        let status = serde_json::to_value(record.status)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        sqlx::query(
            "INSERT INTO visibility_records (namespace_id, workflow_id, run_id, workflow_type, \
             task_queue, status, start_time, close_time, history_length, memo, search_attributes, \
             parent_workflow_id) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
             ON CONFLICT (namespace_id, workflow_id, run_id) DO UPDATE SET
               status = EXCLUDED.status, close_time = EXCLUDED.close_time,
               history_length = EXCLUDED.history_length, search_attributes = EXCLUDED.search_attributes",
        )
        .bind(record.namespace_id)
        .bind(&record.workflow_id)
        .bind(record.run_id)
        .bind(&record.workflow_type)
        .bind(&record.task_queue)
        .bind(status)
        .bind(record.start_time)
        .bind(record.close_time)
        .bind(record.history_length)
        .bind(&record.memo)
        .bind(&record.search_attributes)
        .bind(&record.parent_workflow_id)
        .execute(&self.pool)
        .await?;

        if !record.tags.is_empty() {
            self.update_tags(record.namespace_id, &record.workflow_id, record.run_id, record.tags)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, request: ListRequest) -> Result<VisibilityPage, OrchestratorError> {
        let offset = decode_offset_token(&request.page_token) as i64;
        let limit = request.page_size.clamp(1, 500) as i64;

        let rows = sqlx::query_as::<_, VisibilityRow>(
            "SELECT * FROM visibility_records WHERE namespace_id = $1 \
             ORDER BY start_time DESC LIMIT $2 OFFSET $3",
        )
        .bind(request.namespace_id)
        .bind(limit + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let query = request.query.as_deref().map(VisibilityQuery::parse);
        let mut items: Vec<VisibilityRecord> = rows.into_iter().map(Into::into).collect();
        if let Some(q) = &query {
            items.retain(|r| q.matches(r));
        }

        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);

        Ok(VisibilityPage {
            next_page_token: has_more.then(|| encode_offset_token(offset as u64 + limit as u64)),
            items,
        })
    }

    #[instrument(skip(self))]
    async fn search(
        &self,
        namespace_id: Uuid,
        query: &str,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<VisibilityPage, OrchestratorError> {
        self.list(ListRequest {
            namespace_id,
            query: Some(query.to_string()),
            page_size,
            page_token,
        })
        .await
    }

    #[instrument(skip(self))]
    async fn count(
        &self,
        namespace_id: Uuid,
        query: Option<&str>,
    ) -> Result<i64, OrchestratorError> {
        let rows = sqlx::query_as::<_, VisibilityRow>(
            "SELECT * FROM visibility_records WHERE namespace_id = $1",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await?;
        let parsed = query.map(VisibilityQuery::parse);
        let count = rows
            .into_iter()
            .map(VisibilityRecord::from)
            .filter(|r| parsed.as_ref().is_none_or(|q| q.matches(r)))
            .count();
        Ok(count as i64)
    }

    #[instrument(skip(self, tags))]
    async fn update_tags(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        tags: BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in tags {
            sqlx::query(
                "INSERT INTO workflow_tags (namespace_id, workflow_id, run_id, tag_key, tag_value) \
                 VALUES ($1,$2,$3,$4,$5)
                 ON CONFLICT (namespace_id, workflow_id, run_id, tag_key) DO UPDATE SET tag_value = EXCLUDED.tag_value",
            )
            .bind(namespace_id)
            .bind(workflow_id)
            .bind(run_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, tags))]
    async fn search_by_tags(
        &self,
        namespace_id: Uuid,
        tags: &BTreeMap<String, String>,
        match_all: bool,
    ) -> Result<Vec<VisibilityRecord>, OrchestratorError> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, Uuid, String, String)> = sqlx::query_as(
            "SELECT workflow_id, run_id, tag_key, tag_value FROM workflow_tags WHERE namespace_id = $1",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matched: HashMap<(String, Uuid), usize> = HashMap::new();
        for (workflow_id, run_id, key, value) in rows {
            if tags.get(&key).is_some_and(|v| v == &value) {
                *matched.entry((workflow_id, run_id)).or_insert(0) += 1;
            }
        }

        let keys: Vec<(String, Uuid)> = matched
            .into_iter()
            .filter(|(_, n)| if match_all { *n == tags.len() } else { *n > 0 })
            .map(|(k, _)| k)
            .collect();

        let mut results = Vec::with_capacity(keys.len());
        for (workflow_id, run_id) in keys {
            let row = sqlx::query_as::<_, VisibilityRow>(
                "SELECT * FROM visibility_records WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3",
            )
            .bind(namespace_id)
            .bind(&workflow_id)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                results.push(row.into());
            }
        }
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, OrchestratorError> {
        let result = sqlx::query(
            "DELETE FROM visibility_records WHERE namespace_id = $1 AND close_time < $2",
        )
        .bind(namespace_id)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        sqlx::query(
            "DELETE FROM visibility_records WHERE namespace_id = $1 AND workflow_id = $2 AND run_id = $3",
        )
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct VisibilityRow {
    namespace_id: Uuid,
    workflow_id: String,
    run_id: Uuid,
    workflow_type: String,
    task_queue: String,
    status: serde_json::Value,
    start_time: chrono::DateTime<chrono::Utc>,
    close_time: Option<chrono::DateTime<chrono::Utc>>,
    history_length: i64,
    memo: Option<serde_json::Value>,
    search_attributes: Option<serde_json::Value>,
    parent_workflow_id: Option<String>,
}

impl From<VisibilityRow> for VisibilityRecord {
    fn from(row: VisibilityRow) -> Self {
        let status = serde_json::from_value(row.status).unwrap_or(WorkflowExecutionState::Running);
        VisibilityRecord {
            namespace_id: row.namespace_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            workflow_type: row.workflow_type,
            task_queue: row.task_queue,
            status,
            start_time: row.start_time,
            close_time: row.close_time,
            history_length: row.history_length,
            memo: row.memo,
            search_attributes: row.search_attributes,
            parent_workflow_id: row.parent_workflow_id,
            tags: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

type RecordKey = (Uuid, String, Uuid);

#[derive(Default)]
pub struct InMemoryVisibilityRepository {
    records: RwLock<HashMap<RecordKey, VisibilityRecord>>,
}

impl InMemoryVisibilityRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VisibilityRepository for InMemoryVisibilityRepository {
    async fn upsert(&self, record: VisibilityRecord) -> Result<(), OrchestratorError> {
        let key = (record.namespace_id, record.workflow_id.clone(), record.run_id);
        self.records.write().insert(key, record);
        Ok(())
    }

    async fn list(&self, request: ListRequest) -> Result<VisibilityPage, OrchestratorError> {
        let offset = decode_offset_token(&request.page_token) as usize;
        let limit = request.page_size.clamp(1, 500) as usize;

        let query = request.query.as_deref().map(VisibilityQuery::parse);
        let mut all: Vec<VisibilityRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.namespace_id == request.namespace_id)
            .filter(|r| query.as_ref().is_none_or(|q| q.matches(r)))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let items: Vec<VisibilityRecord> = all.iter().skip(offset).take(limit).cloned().collect();
        let has_more = all.len() > offset + items.len();

        Ok(VisibilityPage {
            next_page_token: has_more.then(|| encode_offset_token((offset + limit) as u64)),
            items,
        })
    }

    async fn search(
        &self,
        namespace_id: Uuid,
        query: &str,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<VisibilityPage, OrchestratorError> {
        self.list(ListRequest {
            namespace_id,
            query: Some(query.to_string()),
            page_size,
            page_token,
        })
        .await
    }

    async fn count(
        &self,
        namespace_id: Uuid,
        query: Option<&str>,
    ) -> Result<i64, OrchestratorError> {
        let parsed = query.map(VisibilityQuery::parse);
        let count = self
            .records
            .read()
            .values()
            .filter(|r| r.namespace_id == namespace_id)
            .filter(|r| parsed.as_ref().is_none_or(|q| q.matches(r)))
            .count();
        Ok(count as i64)
    }

    async fn update_tags(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        tags: BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let key = (namespace_id, workflow_id.to_string(), run_id);
        if let Some(record) = self.records.write().get_mut(&key) {
            record.tags.extend(tags);
        }
        Ok(())
    }

    async fn search_by_tags(
        &self,
        namespace_id: Uuid,
        tags: &BTreeMap<String, String>,
        match_all: bool,
    ) -> Result<Vec<VisibilityRecord>, OrchestratorError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.namespace_id == namespace_id)
            .filter(|r| {
                let matches = tags.iter().filter(|(k, v)| r.tags.get(*k) == Some(*v)).count();
                if match_all {
                    matches == tags.len()
                } else {
                    matches > 0
                }
            })
            .cloned()
            .collect())
    }

    async fn archive_older_than(
        &self,
        namespace_id: Uuid,
        threshold: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, OrchestratorError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|k, r| {
            k.0 != namespace_id || r.close_time.is_none_or(|t| t >= threshold)
        });
        Ok((before - records.len()) as u64)
    }

    async fn delete(
        &self,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        self.records
            .write()
            .remove(&(namespace_id, workflow_id.to_string(), run_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(ns: Uuid, workflow_id: &str, status: WorkflowExecutionState) -> VisibilityRecord {
        VisibilityRecord {
            namespace_id: ns,
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::now_v7(),
            workflow_type: "greet".to_string(),
            task_queue: "q".to_string(),
            status,
            start_time: Utc::now(),
            close_time: None,
            history_length: 1,
            memo: None,
            search_attributes: None,
            parent_workflow_id: None,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn parses_single_field_filter() {
        let q = VisibilityQuery::parse("WorkflowType = 'greet'");
        assert_eq!(
            q.filters,
            vec![VisibilityFilter {
                field: VisibilityField::WorkflowType,
                value: "greet".to_string()
            }]
        );
        assert!(q.free_text.is_none());
    }

    #[test]
    fn parses_conjunction() {
        let q = VisibilityQuery::parse("WorkflowType = 'greet' AND Status = 'running'");
        assert_eq!(q.filters.len(), 2);
    }

    #[test]
    fn unknown_field_folds_into_free_text() {
        let q = VisibilityQuery::parse("mystery_search_term");
        assert!(q.filters.is_empty());
        assert_eq!(q.free_text.as_deref(), Some("mystery_search_term"));
    }

    #[tokio::test]
    async fn upsert_then_list_roundtrip() {
        let repo = InMemoryVisibilityRepository::new();
        let ns = Uuid::now_v7();
        let rec = record(ns, "wf-1", WorkflowExecutionState::Running);
        repo.upsert(rec.clone()).await.unwrap();

        let page = repo
            .list(ListRequest {
                namespace_id: ns,
                query: None,
                page_size: 10,
                page_token: None,
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn search_filters_by_status() {
        let repo = InMemoryVisibilityRepository::new();
        let ns = Uuid::now_v7();
        repo.upsert(record(ns, "wf-1", WorkflowExecutionState::Running)).await.unwrap();
        repo.upsert(record(ns, "wf-2", WorkflowExecutionState::Completed)).await.unwrap();

        let page = repo.search(ns, "Status = 'completed'", 10, None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].workflow_id, "wf-2");
    }

    #[tokio::test]
    async fn tags_round_trip_and_match_all() {
        let repo = InMemoryVisibilityRepository::new();
        let ns = Uuid::now_v7();
        let rec = record(ns, "wf-1", WorkflowExecutionState::Running);
        repo.upsert(rec.clone()).await.unwrap();

        let mut tags = BTreeMap::new();
        tags.insert("env".to_string(), "prod".to_string());
        tags.insert("team".to_string(), "payments".to_string());
        repo.update_tags(ns, "wf-1", rec.run_id, tags.clone()).await.unwrap();

        let found = repo.search_by_tags(ns, &tags, true).await.unwrap();
        assert_eq!(found.len(), 1);

        let mut partial = BTreeMap::new();
        partial.insert("env".to_string(), "staging".to_string());
        let not_found = repo.search_by_tags(ns, &partial, true).await.unwrap();
        assert!(not_found.is_empty());
    }
}

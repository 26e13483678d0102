//! Namespace repository: `create`, `getByName`, `getById`, `update`,
//! `list`, `exists`, `archive`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{Namespace, NamespaceStatus};

use super::{decode_offset_token, encode_offset_token, PageToken};

/// Result of a paginated list.
pub struct NamespacePage {
    pub items: Vec<Namespace>,
    pub next_page_token: Option<PageToken>,
}

#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    async fn create(&self, namespace: Namespace) -> Result<Namespace, OrchestratorError>;

    /// Excludes soft-deleted namespaces.
    async fn get_by_name(&self, name: &str) -> Result<Namespace, OrchestratorError>;

    async fn get_by_id(&self, namespace_id: Uuid) -> Result<Namespace, OrchestratorError>;

    async fn update(&self, namespace: Namespace) -> Result<Namespace, OrchestratorError>;

    async fn list(
        &self,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<NamespacePage, OrchestratorError>;

    async fn exists(&self, name: &str) -> Result<bool, OrchestratorError>;

    /// Idempotent soft-delete: transitions `status -> Deleted`.
    async fn archive(&self, name: &str) -> Result<(), OrchestratorError>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

/// `namespaces(namespace_id PK, namespace_name UNIQUE WHERE status<>deleted, ...)`
pub struct PostgresNamespaceRepository {
    pool: PgPool,
}

impl PostgresNamespaceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NamespaceRepository for PostgresNamespaceRepository {
    #[instrument(skip(self, namespace))]
    async fn create(&self, namespace: Namespace) -> Result<Namespace, OrchestratorError> {
        let status = serde_json::to_value(namespace.status)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;

        let existing = sqlx::query("SELECT 1 FROM namespaces WHERE namespace_name = $1 AND status <> 'deleted'")
            .bind(&namespace.name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(OrchestratorError::AlreadyExists(format!(
                "namespace '{}' already exists",
                namespace.name
            )));
        }

        sqlx::query(
            "INSERT INTO namespaces (namespace_id, namespace_name, description, owner_id, \
             retention_days, history_archival_enabled, visibility_archival_enabled, status, \
             created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(namespace.namespace_id)
        .bind(&namespace.name)
        .bind(&namespace.description)
        .bind(&namespace.owner_id)
        .bind(namespace.retention_days)
        .bind(namespace.history_archival_enabled)
        .bind(namespace.visibility_archival_enabled)
        .bind(status)
        .bind(namespace.created_at)
        .bind(namespace.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(namespace = %namespace.name, "namespace created");
        Ok(namespace)
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> Result<Namespace, OrchestratorError> {
        let row = sqlx::query_as::<_, NamespaceRow>(
            "SELECT * FROM namespaces WHERE namespace_name = $1 AND status <> 'deleted'",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("namespace '{name}' not found")))?;

        row.try_into()
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, namespace_id: Uuid) -> Result<Namespace, OrchestratorError> {
        let row = sqlx::query_as::<_, NamespaceRow>("SELECT * FROM namespaces WHERE namespace_id = $1")
            .bind(namespace_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("namespace {namespace_id} not found")))?;

        row.try_into()
    }

    #[instrument(skip(self, namespace))]
    async fn update(&self, namespace: Namespace) -> Result<Namespace, OrchestratorError> {
        let status = serde_json::to_value(namespace.status)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE namespaces SET description = $2, owner_id = $3, retention_days = $4, \
             history_archival_enabled = $5, visibility_archival_enabled = $6, status = $7, \
             updated_at = $8 WHERE namespace_id = $1",
        )
        .bind(namespace.namespace_id)
        .bind(&namespace.description)
        .bind(&namespace.owner_id)
        .bind(namespace.retention_days)
        .bind(namespace.history_archival_enabled)
        .bind(namespace.visibility_archival_enabled)
        .bind(status)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!(
                "namespace {} not found",
                namespace.namespace_id
            )));
        }
        Ok(namespace)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<NamespacePage, OrchestratorError> {
        let offset = decode_offset_token(&page_token) as i64;
        let limit = page_size.clamp(1, 500) as i64;

        let rows = sqlx::query_as::<_, NamespaceRow>(
            "SELECT * FROM namespaces WHERE status <> 'deleted' ORDER BY namespace_name \
             LIMIT $1 OFFSET $2",
        )
        .bind(limit + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let items: Result<Vec<Namespace>, OrchestratorError> = rows
            .into_iter()
            .take(limit as usize)
            .map(TryInto::try_into)
            .collect();
        let items = items?;

        Ok(NamespacePage {
            next_page_token: has_more.then(|| encode_offset_token(offset as u64 + limit as u64)),
            items,
        })
    }

    #[instrument(skip(self))]
    async fn exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        let row = sqlx::query("SELECT 1 FROM namespaces WHERE namespace_name = $1 AND status <> 'deleted'")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn archive(&self, name: &str) -> Result<(), OrchestratorError> {
        sqlx::query("UPDATE namespaces SET status = 'deleted', updated_at = now() WHERE namespace_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct NamespaceRow {
    namespace_id: Uuid,
    namespace_name: String,
    description: Option<String>,
    owner_id: Option<String>,
    retention_days: i32,
    history_archival_enabled: bool,
    visibility_archival_enabled: bool,
    status: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<NamespaceRow> for Namespace {
    type Error = OrchestratorError;

    fn try_from(row: NamespaceRow) -> Result<Self, Self::Error> {
        let status: NamespaceStatus = serde_json::from_value(row.status)
            .map_err(|e| OrchestratorError::PersistenceError(e.to_string()))?;
        Ok(Namespace {
            namespace_id: row.namespace_id,
            name: row.namespace_name,
            description: row.description,
            owner_id: row.owner_id,
            retention_days: row.retention_days,
            history_archival_enabled: row.history_archival_enabled,
            visibility_archival_enabled: row.visibility_archival_enabled,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryNamespaceRepository {
    by_name: RwLock<HashMap<String, Namespace>>,
}

impl InMemoryNamespaceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NamespaceRepository for InMemoryNamespaceRepository {
    async fn create(&self, namespace: Namespace) -> Result<Namespace, OrchestratorError> {
        let mut map = self.by_name.write();
        if let Some(existing) = map.get(&namespace.name) {
            if existing.status != NamespaceStatus::Deleted {
                return Err(OrchestratorError::AlreadyExists(format!(
                    "namespace '{}' already exists",
                    namespace.name
                )));
            }
        }
        map.insert(namespace.name.clone(), namespace.clone());
        Ok(namespace)
    }

    async fn get_by_name(&self, name: &str) -> Result<Namespace, OrchestratorError> {
        self.by_name
            .read()
            .get(name)
            .filter(|ns| ns.status != NamespaceStatus::Deleted)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("namespace '{name}' not found")))
    }

    async fn get_by_id(&self, namespace_id: Uuid) -> Result<Namespace, OrchestratorError> {
        self.by_name
            .read()
            .values()
            .find(|ns| ns.namespace_id == namespace_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("namespace {namespace_id} not found")))
    }

    async fn update(&self, mut namespace: Namespace) -> Result<Namespace, OrchestratorError> {
        let mut map = self.by_name.write();
        if !map.contains_key(&namespace.name) {
            return Err(OrchestratorError::NotFound(format!(
                "namespace '{}' not found",
                namespace.name
            )));
        }
        namespace.updated_at = chrono::Utc::now();
        map.insert(namespace.name.clone(), namespace.clone());
        Ok(namespace)
    }

    async fn list(
        &self,
        page_size: u32,
        page_token: Option<PageToken>,
    ) -> Result<NamespacePage, OrchestratorError> {
        let offset = decode_offset_token(&page_token) as usize;
        let limit = page_size.clamp(1, 500) as usize;

        let mut all: Vec<Namespace> = self
            .by_name
            .read()
            .values()
            .filter(|ns| ns.status != NamespaceStatus::Deleted)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));

        let items: Vec<Namespace> = all.iter().skip(offset).take(limit).cloned().collect();
        let has_more = all.len() > offset + items.len();

        Ok(NamespacePage {
            next_page_token: has_more.then(|| encode_offset_token((offset + limit) as u64)),
            items,
        })
    }

    async fn exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        Ok(self
            .by_name
            .read()
            .get(name)
            .is_some_and(|ns| ns.status != NamespaceStatus::Deleted))
    }

    async fn archive(&self, name: &str) -> Result<(), OrchestratorError> {
        if let Some(ns) = self.by_name.write().get_mut(name) {
            ns.status = NamespaceStatus::Deleted;
            ns.updated_at = chrono::Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_by_name() {
        let repo = InMemoryNamespaceRepository::new();
        let ns = Namespace::new("acme");
        repo.create(ns.clone()).await.unwrap();

        let fetched = repo.get_by_name("acme").await.unwrap();
        assert_eq!(fetched.namespace_id, ns.namespace_id);
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let repo = InMemoryNamespaceRepository::new();
        repo.create(Namespace::new("acme")).await.unwrap();

        let err = repo.create(Namespace::new("acme")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn archive_is_idempotent() {
        let repo = InMemoryNamespaceRepository::new();
        repo.create(Namespace::new("acme")).await.unwrap();

        repo.archive("acme").await.unwrap();
        let first = repo.exists("acme").await.unwrap();
        repo.archive("acme").await.unwrap();
        let second = repo.exists("acme").await.unwrap();

        assert_eq!(first, second);
        assert!(!second);
    }

    #[tokio::test]
    async fn archived_namespace_excluded_from_lookup() {
        let repo = InMemoryNamespaceRepository::new();
        repo.create(Namespace::new("acme")).await.unwrap();
        repo.archive("acme").await.unwrap();

        let err = repo.get_by_name("acme").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_paginates_with_offset_token() {
        let repo = InMemoryNamespaceRepository::new();
        for i in 0..5 {
            repo.create(Namespace::new(format!("ns-{i}"))).await.unwrap();
        }

        let page1 = repo.list(2, None).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(page1.next_page_token.is_some());

        let page2 = repo.list(2, page1.next_page_token).await.unwrap();
        assert_eq!(page2.items.len(), 2);

        let page3 = repo.list(2, page2.next_page_token).await.unwrap();
        assert_eq!(page3.items.len(), 1);
        assert!(page3.next_page_token.is_none());
    }
}

//! Task queue repository: enqueue, leased poll, heartbeat, complete, fail
//! with optional requeue, depth, and expired-lease reclamation.
//!
//! The poll path is the one place a `SELECT ... FOR UPDATE SKIP LOCKED`
//! matters: it lets many workers poll the same queue concurrently without
//! lock contention on rows they will not end up claiming.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::{TaskLease, TaskQueueItem, TaskQueueType};

/// Default requeue backoff (`ORCH_REQUEUE_DELAY_SECONDS`).
pub const DEFAULT_REQUEUE_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

pub struct QueueStats {
    pub queue_name: String,
    pub pending_tasks: i64,
    pub active_leases: i64,
}

#[async_trait]
pub trait TaskQueueRepository: Send + Sync {
    /// Unique by `(namespace_id, queue_name, queue_type, task_id)`.
    async fn enqueue(&self, item: TaskQueueItem) -> Result<(), OrchestratorError>;

    /// Atomically selects the earliest-`scheduled_at` ready task with no
    /// live lease, creates a lease for it, and returns both.
    async fn poll(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
        queue_type: TaskQueueType,
        worker_identity: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<(TaskQueueItem, TaskLease)>, OrchestratorError>;

    /// Extends `lease_expires_at` only for leases that are still live.
    async fn heartbeat(
        &self,
        lease_id: Uuid,
        extension: std::time::Duration,
    ) -> Result<TaskLease, OrchestratorError>;

    /// Deletes the lease and its task atomically.
    async fn complete(&self, lease_id: Uuid) -> Result<(), OrchestratorError>;

    /// Deletes the lease. If `requeue`, the task is rescheduled at
    /// `now + backoff` with `attempt_count` incremented; otherwise the task
    /// is deleted too.
    async fn fail(
        &self,
        lease_id: Uuid,
        reason: &str,
        requeue: bool,
        backoff: std::time::Duration,
    ) -> Result<(), OrchestratorError>;

    async fn depth(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
    ) -> Result<QueueStats, OrchestratorError>;

    async fn list_queues(
        &self,
        namespace_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>, OrchestratorError>;

    /// Deletes leases whose `lease_expires_at` has passed, making their
    /// tasks eligible for re-polling. Returns the number reclaimed.
    async fn reclaim_expired_leases(&self) -> Result<u64, OrchestratorError>;

    async fn purge_older_than(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<u64, OrchestratorError>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresTaskQueueRepository {
    pool: PgPool,
}

impl PostgresTaskQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn queue_type_str(t: TaskQueueType) -> &'static str {
    match t {
        TaskQueueType::Workflow => "workflow",
        TaskQueueType::Activity => "activity",
    }
}

fn parse_queue_type(s: &str) -> Result<TaskQueueType, OrchestratorError> {
    match s {
        "workflow" => Ok(TaskQueueType::Workflow),
        "activity" => Ok(TaskQueueType::Activity),
        other => Err(OrchestratorError::PersistenceError(format!(
            "unknown task_queue_type '{other}'"
        ))),
    }
}

#[async_trait]
impl TaskQueueRepository for PostgresTaskQueueRepository {
    #[instrument(skip(self, item))]
    async fn enqueue(&self, item: TaskQueueItem) -> Result<(), OrchestratorError> {
        let result = sqlx::query(
            "INSERT INTO task_queues (namespace_id, task_queue_name, task_queue_type, task_id, \
             workflow_id, run_id, scheduled_at, expiry_at, task_data, partition_hash, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10, now())",
        )
        .bind(item.namespace_id)
        .bind(&item.task_queue_name)
        .bind(queue_type_str(item.task_queue_type))
        .bind(item.task_id)
        .bind(&item.workflow_id)
        .bind(item.run_id)
        .bind(item.scheduled_at)
        .bind(item.expiry_at)
        .bind(&item.task_data)
        .bind(item.partition_hash as i32)
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.is_unique_violation() {
                return Err(OrchestratorError::AlreadyExists(format!(
                    "task {} already enqueued",
                    item.task_id
                )));
            }
        }
        result?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn poll(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
        queue_type: TaskQueueType,
        worker_identity: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<(TaskQueueItem, TaskLease)>, OrchestratorError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT t.* FROM task_queues t
             WHERE t.namespace_id = $1 AND t.task_queue_name = $2 AND t.task_queue_type = $3
               AND t.scheduled_at <= now()
               AND (t.expiry_at IS NULL OR t.expiry_at > now())
               AND NOT EXISTS (
                   SELECT 1 FROM task_queue_leases l
                   WHERE l.namespace_id = t.namespace_id
                     AND l.task_queue_name = t.task_queue_name
                     AND l.task_queue_type = t.task_queue_type
                     AND l.task_id = t.task_id
                     AND l.lease_expires_at > now()
               )
             ORDER BY t.scheduled_at ASC, t.task_id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(namespace_id)
        .bind(queue_name)
        .bind(queue_type_str(queue_type))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let attempt_count: i32 = sqlx::query_scalar(
            "SELECT coalesce(max(attempt_count), 0) FROM task_queue_leases
             WHERE namespace_id = $1 AND task_queue_name = $2 AND task_queue_type = $3 AND task_id = $4",
        )
        .bind(namespace_id)
        .bind(queue_name)
        .bind(queue_type_str(queue_type))
        .bind(row.task_id)
        .fetch_one(&mut *tx)
        .await?;

        let lease_id = Uuid::now_v7();
        let now = Utc::now();
        let expires = now + ChronoDuration::from_std(lease_duration).unwrap_or(ChronoDuration::zero());

        sqlx::query(
            "INSERT INTO task_queue_leases (lease_id, namespace_id, task_queue_name, \
             task_queue_type, task_id, worker_identity, leased_at, lease_expires_at, \
             heartbeat_at, attempt_count) VALUES ($1,$2,$3,$4,$5,$6,$7,$7,$8)",
        )
        .bind(lease_id)
        .bind(namespace_id)
        .bind(queue_name)
        .bind(queue_type_str(queue_type))
        .bind(row.task_id)
        .bind(worker_identity)
        .bind(now)
        .bind(expires)
        .bind(attempt_count + 1)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let task: TaskQueueItem = row.try_into()?;
        let lease = TaskLease {
            lease_id,
            namespace_id,
            task_queue_name: queue_name.to_string(),
            task_queue_type: queue_type,
            task_id: task.task_id,
            worker_identity: worker_identity.to_string(),
            leased_at: now,
            lease_expires_at: expires,
            heartbeat_at: now,
            attempt_count: attempt_count + 1,
        };

        debug!(task_id = task.task_id, %lease_id, "task polled and leased");
        Ok(Some((task, lease)))
    }

    #[instrument(skip(self))]
    async fn heartbeat(
        &self,
        lease_id: Uuid,
        extension: std::time::Duration,
    ) -> Result<TaskLease, OrchestratorError> {
        let expires = Utc::now() + ChronoDuration::from_std(extension).unwrap_or(ChronoDuration::zero());
        let row = sqlx::query_as::<_, LeaseRow>(
            "UPDATE task_queue_leases SET lease_expires_at = $2, heartbeat_at = now()
             WHERE lease_id = $1 AND lease_expires_at > now() RETURNING *",
        )
        .bind(lease_id)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn complete(&self, lease_id: Uuid) -> Result<(), OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let lease = sqlx::query_as::<_, LeaseRow>(
            "DELETE FROM task_queue_leases WHERE lease_id = $1 RETURNING *",
        )
        .bind(lease_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;

        sqlx::query(
            "DELETE FROM task_queues WHERE namespace_id = $1 AND task_queue_name = $2 \
             AND task_queue_type = $3 AND task_id = $4",
        )
        .bind(lease.namespace_id)
        .bind(&lease.task_queue_name)
        .bind(&lease.task_queue_type)
        .bind(lease.task_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail(
        &self,
        lease_id: Uuid,
        _reason: &str,
        requeue: bool,
        backoff: std::time::Duration,
    ) -> Result<(), OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let lease = sqlx::query_as::<_, LeaseRow>(
            "DELETE FROM task_queue_leases WHERE lease_id = $1 RETURNING *",
        )
        .bind(lease_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;

        if requeue {
            let next_scheduled =
                Utc::now() + ChronoDuration::from_std(backoff).unwrap_or(ChronoDuration::zero());
            sqlx::query(
                "UPDATE task_queues SET scheduled_at = $5 WHERE namespace_id = $1 \
                 AND task_queue_name = $2 AND task_queue_type = $3 AND task_id = $4",
            )
            .bind(lease.namespace_id)
            .bind(&lease.task_queue_name)
            .bind(&lease.task_queue_type)
            .bind(lease.task_id)
            .bind(next_scheduled)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "DELETE FROM task_queues WHERE namespace_id = $1 AND task_queue_name = $2 \
                 AND task_queue_type = $3 AND task_id = $4",
            )
            .bind(lease.namespace_id)
            .bind(&lease.task_queue_name)
            .bind(&lease.task_queue_type)
            .bind(lease.task_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn depth(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
    ) -> Result<QueueStats, OrchestratorError> {
        let pending: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM task_queues WHERE namespace_id = $1 AND task_queue_name = $2",
        )
        .bind(namespace_id)
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        let active: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM task_queue_leases WHERE namespace_id = $1 \
             AND task_queue_name = $2 AND lease_expires_at > now()",
        )
        .bind(namespace_id)
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            pending_tasks: pending,
            active_leases: active,
        })
    }

    #[instrument(skip(self))]
    async fn list_queues(
        &self,
        namespace_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>, OrchestratorError> {
        let rows: Vec<(String, i64)> = if let Some(ns) = namespace_id {
            sqlx::query_as(
                "SELECT task_queue_name, count(*) FROM task_queues WHERE namespace_id = $1 \
                 GROUP BY task_queue_name",
            )
            .bind(ns)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as("SELECT task_queue_name, count(*) FROM task_queues GROUP BY task_queue_name")
                .fetch_all(&self.pool)
                .await?
        };
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired_leases(&self) -> Result<u64, OrchestratorError> {
        let result = sqlx::query("DELETE FROM task_queue_leases WHERE lease_expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn purge_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, OrchestratorError> {
        let result = sqlx::query("DELETE FROM task_queues WHERE scheduled_at < $1")
            .bind(threshold)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    namespace_id: Uuid,
    task_queue_name: String,
    task_queue_type: String,
    task_id: i64,
    workflow_id: String,
    run_id: Uuid,
    scheduled_at: DateTime<Utc>,
    expiry_at: Option<DateTime<Utc>>,
    task_data: serde_json::Value,
    partition_hash: i32,
}

impl TryFrom<TaskRow> for TaskQueueItem {
    type Error = OrchestratorError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(TaskQueueItem {
            namespace_id: row.namespace_id,
            task_queue_name: row.task_queue_name,
            task_queue_type: parse_queue_type(&row.task_queue_type)?,
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            scheduled_at: row.scheduled_at,
            expiry_at: row.expiry_at,
            task_data: row.task_data,
            partition_hash: row.partition_hash as u32,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    lease_id: Uuid,
    namespace_id: Uuid,
    task_queue_name: String,
    task_queue_type: String,
    task_id: i64,
    worker_identity: String,
    leased_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    attempt_count: i32,
}

impl TryFrom<LeaseRow> for TaskLease {
    type Error = OrchestratorError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        Ok(TaskLease {
            lease_id: row.lease_id,
            namespace_id: row.namespace_id,
            task_queue_name: row.task_queue_name,
            task_queue_type: parse_queue_type(&row.task_queue_type)?,
            task_id: row.task_id,
            worker_identity: row.worker_identity,
            leased_at: row.leased_at,
            lease_expires_at: row.lease_expires_at,
            heartbeat_at: row.heartbeat_at,
            attempt_count: row.attempt_count,
        })
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

type TaskKey = (Uuid, String, TaskQueueType, i64);

#[derive(Default)]
pub struct InMemoryTaskQueueRepository {
    tasks: RwLock<HashMap<TaskKey, TaskQueueItem>>,
    leases: RwLock<HashMap<Uuid, TaskLease>>,
    attempts: RwLock<HashMap<TaskKey, i32>>,
}

impl InMemoryTaskQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn task_key(item: &TaskQueueItem) -> TaskKey {
        (
            item.namespace_id,
            item.task_queue_name.clone(),
            item.task_queue_type,
            item.task_id,
        )
    }

    fn has_live_lease(&self, key: &TaskKey, now: DateTime<Utc>) -> bool {
        self.leases
            .read()
            .values()
            .any(|l| {
                (l.namespace_id, l.task_queue_name.clone(), l.task_queue_type, l.task_id) == *key
                    && !l.is_expired(now)
            })
    }
}

#[async_trait]
impl TaskQueueRepository for InMemoryTaskQueueRepository {
    async fn enqueue(&self, item: TaskQueueItem) -> Result<(), OrchestratorError> {
        let key = Self::task_key(&item);
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&key) {
            return Err(OrchestratorError::AlreadyExists(format!(
                "task {} already enqueued",
                item.task_id
            )));
        }
        tasks.insert(key, item);
        Ok(())
    }

    async fn poll(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
        queue_type: TaskQueueType,
        worker_identity: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<(TaskQueueItem, TaskLease)>, OrchestratorError> {
        let now = Utc::now();
        let candidate = {
            let tasks = self.tasks.read();
            let mut ready: Vec<&TaskQueueItem> = tasks
                .values()
                .filter(|t| {
                    t.namespace_id == namespace_id
                        && t.task_queue_name == queue_name
                        && t.task_queue_type == queue_type
                        && t.scheduled_at <= now
                        && t.expiry_at.is_none_or(|exp| exp > now)
                })
                .collect();
            ready.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.task_id.cmp(&b.task_id)));
            ready
                .into_iter()
                .find(|t| !self.has_live_lease(&Self::task_key(t), now))
                .cloned()
        };

        let Some(task) = candidate else {
            return Ok(None);
        };

        let key = Self::task_key(&task);
        let attempt_count = {
            let mut attempts = self.attempts.write();
            let counter = attempts.entry(key).or_insert(0);
            *counter += 1;
            *counter
        };

        let lease = TaskLease {
            lease_id: Uuid::now_v7(),
            namespace_id,
            task_queue_name: queue_name.to_string(),
            task_queue_type: queue_type,
            task_id: task.task_id,
            worker_identity: worker_identity.to_string(),
            leased_at: now,
            lease_expires_at: now
                + ChronoDuration::from_std(lease_duration).unwrap_or(ChronoDuration::zero()),
            heartbeat_at: now,
            attempt_count,
        };
        self.leases.write().insert(lease.lease_id, lease.clone());

        Ok(Some((task, lease)))
    }

    async fn heartbeat(
        &self,
        lease_id: Uuid,
        extension: std::time::Duration,
    ) -> Result<TaskLease, OrchestratorError> {
        let now = Utc::now();
        let mut leases = self.leases.write();
        let lease = leases
            .get_mut(&lease_id)
            .filter(|l| !l.is_expired(now))
            .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;
        lease.lease_expires_at =
            now + ChronoDuration::from_std(extension).unwrap_or(ChronoDuration::zero());
        lease.heartbeat_at = now;
        Ok(lease.clone())
    }

    async fn complete(&self, lease_id: Uuid) -> Result<(), OrchestratorError> {
        let lease = self
            .leases
            .write()
            .remove(&lease_id)
            .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;
        let key = (
            lease.namespace_id,
            lease.task_queue_name,
            lease.task_queue_type,
            lease.task_id,
        );
        self.tasks.write().remove(&key);
        self.attempts.write().remove(&key);
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: Uuid,
        _reason: &str,
        requeue: bool,
        backoff: std::time::Duration,
    ) -> Result<(), OrchestratorError> {
        let lease = self
            .leases
            .write()
            .remove(&lease_id)
            .ok_or_else(|| OrchestratorError::TaskLeaseExpired(lease_id.to_string()))?;
        let key = (
            lease.namespace_id,
            lease.task_queue_name.clone(),
            lease.task_queue_type,
            lease.task_id,
        );
        if requeue {
            if let Some(task) = self.tasks.write().get_mut(&key) {
                task.scheduled_at =
                    Utc::now() + ChronoDuration::from_std(backoff).unwrap_or(ChronoDuration::zero());
            }
        } else {
            self.tasks.write().remove(&key);
            self.attempts.write().remove(&key);
        }
        Ok(())
    }

    async fn depth(
        &self,
        namespace_id: Uuid,
        queue_name: &str,
    ) -> Result<QueueStats, OrchestratorError> {
        let now = Utc::now();
        let pending = self
            .tasks
            .read()
            .values()
            .filter(|t| t.namespace_id == namespace_id && t.task_queue_name == queue_name)
            .count() as i64;
        let active = self
            .leases
            .read()
            .values()
            .filter(|l| {
                l.namespace_id == namespace_id
                    && l.task_queue_name == queue_name
                    && !l.is_expired(now)
            })
            .count() as i64;
        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            pending_tasks: pending,
            active_leases: active,
        })
    }

    async fn list_queues(
        &self,
        namespace_id: Option<Uuid>,
    ) -> Result<HashMap<String, i64>, OrchestratorError> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for task in self.tasks.read().values() {
            if namespace_id.is_some_and(|ns| ns != task.namespace_id) {
                continue;
            }
            *counts.entry(task.task_queue_name.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, OrchestratorError> {
        let now = Utc::now();
        let mut leases = self.leases.write();
        let expired: Vec<Uuid> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.lease_id)
            .collect();
        for id in &expired {
            leases.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn purge_older_than(&self, threshold: DateTime<Utc>) -> Result<u64, OrchestratorError> {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, t| t.scheduled_at >= threshold);
        Ok((before - tasks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(namespace_id: Uuid, task_id: i64) -> TaskQueueItem {
        TaskQueueItem {
            namespace_id,
            task_queue_name: "q".to_string(),
            task_queue_type: TaskQueueType::Activity,
            task_id,
            workflow_id: "wf-1".to_string(),
            run_id: Uuid::now_v7(),
            scheduled_at: Utc::now(),
            expiry_at: None,
            task_data: serde_json::Value::Null,
            partition_hash: 0,
        }
    }

    #[tokio::test]
    async fn enqueue_then_poll_then_complete() {
        let repo = InMemoryTaskQueueRepository::new();
        let ns = Uuid::now_v7();
        repo.enqueue(item(ns, 1)).await.unwrap();

        let (task, lease) = repo
            .poll(ns, "q", TaskQueueType::Activity, "w1", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.task_id, 1);
        assert_eq!(lease.attempt_count, 1);

        repo.complete(lease.lease_id).await.unwrap();
        let depth = repo.depth(ns, "q").await.unwrap();
        assert_eq!(depth.pending_tasks, 0);
    }

    #[tokio::test]
    async fn in_flight_task_not_redelivered() {
        let repo = InMemoryTaskQueueRepository::new();
        let ns = Uuid::now_v7();
        repo.enqueue(item(ns, 1)).await.unwrap();
        repo.poll(ns, "q", TaskQueueType::Activity, "w1", std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let second = repo
            .poll(ns, "q", TaskQueueType::Activity, "w2", std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_reclamation_allows_redelivery() {
        let repo = InMemoryTaskQueueRepository::new();
        let ns = Uuid::now_v7();
        repo.enqueue(item(ns, 1)).await.unwrap();
        repo.poll(ns, "q", TaskQueueType::Activity, "w1", std::time::Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        repo.reclaim_expired_leases().await.unwrap();
        let (task, lease) = repo
            .poll(ns, "q", TaskQueueType::Activity, "w2", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.task_id, 1);
        assert!(lease.attempt_count >= 2);
    }

    #[tokio::test]
    async fn fail_without_requeue_deletes_task() {
        let repo = InMemoryTaskQueueRepository::new();
        let ns = Uuid::now_v7();
        repo.enqueue(item(ns, 1)).await.unwrap();
        let (_, lease) = repo
            .poll(ns, "q", TaskQueueType::Activity, "w1", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        repo.fail(lease.lease_id, "boom", false, DEFAULT_REQUEUE_DELAY)
            .await
            .unwrap();
        let depth = repo.depth(ns, "q").await.unwrap();
        assert_eq!(depth.pending_tasks, 0);
    }

    #[tokio::test]
    async fn heartbeat_on_expired_lease_fails() {
        let repo = InMemoryTaskQueueRepository::new();
        let ns = Uuid::now_v7();
        repo.enqueue(item(ns, 1)).await.unwrap();
        let (_, lease) = repo
            .poll(ns, "q", TaskQueueType::Activity, "w1", std::time::Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = repo
            .heartbeat(lease.lease_id, std::time::Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskLeaseExpired(_)));
    }
}

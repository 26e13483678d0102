//! Shard repository: lease-based exclusive ownership over one partition of
//! the workflowId hash space.
//!
//! `acquire` succeeds only if the row is unowned or its lease has expired;
//! `renew`/`release` succeed only if the caller is the current, non-expired
//! owner. Tie-breaking between concurrent `acquire` attempts is resolved by
//! whichever transaction commits first — the loser observes a row with an
//! unexpired lease and the repository reports it as unavailable.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::error::OrchestratorError;
use crate::model::Shard;

#[async_trait]
pub trait ShardRepository: Send + Sync {
    /// Create the `shard_count` shard rows, each covering one `S`-th of the
    /// 32-bit key space. Idempotent: existing rows are left untouched.
    async fn initialize_shards(&self, shard_count: u32) -> Result<(), OrchestratorError>;

    /// Succeeds only if the row is unowned or its lease has expired.
    async fn acquire_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError>;

    /// Succeeds only if `owner` is the current, non-expired owner.
    async fn renew_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError>;

    /// Succeeds only if `owner` is the current owner. Releasing a shard this
    /// caller does not own is a no-op, not an error.
    async fn release_lease(&self, shard_id: u32, owner: &str) -> Result<(), OrchestratorError>;

    async fn get_lease(&self, shard_id: u32) -> Result<Shard, OrchestratorError>;

    async fn list_owned(&self, owner: &str) -> Result<Vec<Shard>, OrchestratorError>;

    async fn list_all(&self) -> Result<Vec<Shard>, OrchestratorError>;

    /// Clears ownership of every shard whose lease has expired. Returns the
    /// shard ids reclaimed.
    async fn reclaim_expired(&self) -> Result<Vec<u32>, OrchestratorError>;
}

// ---------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------

pub struct PostgresShardRepository {
    pool: PgPool,
}

impl PostgresShardRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShardRepository for PostgresShardRepository {
    #[instrument(skip(self))]
    async fn initialize_shards(&self, shard_count: u32) -> Result<(), OrchestratorError> {
        let range_width = (u64::from(u32::MAX) + 1) / u64::from(shard_count).max(1);
        let mut tx = self.pool.begin().await?;
        for shard_id in 0..shard_count {
            let start = u64::from(shard_id) * range_width;
            let end = start + range_width;
            sqlx::query(
                "INSERT INTO history_shards (shard_id, range_start, range_end) \
                 VALUES ($1, $2, $3) ON CONFLICT (shard_id) DO NOTHING",
            )
            .bind(shard_id as i32)
            .bind(start as i64)
            .bind(end as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ShardRow>(
            "SELECT * FROM history_shards WHERE shard_id = $1 FOR UPDATE",
        )
        .bind(shard_id as i32)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))?;

        let now = Utc::now();
        let unowned = row.owner_identity.is_none()
            || row.lease_expires_at.is_none_or(|exp| exp < now);
        if !unowned {
            return Err(OrchestratorError::ShardUnavailable {
                shard_id,
                reason: format!("owned by {}", row.owner_identity.unwrap_or_default()),
            });
        }

        let expires = now + ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        sqlx::query(
            "UPDATE history_shards SET owner_identity = $2, lease_expires_at = $3, \
             acquired_at = $4, last_heartbeat = $4 WHERE shard_id = $1",
        )
        .bind(shard_id as i32)
        .bind(owner)
        .bind(expires)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(shard_id, owner, "shard lease acquired");
        Ok(Shard {
            shard_id,
            owner_identity: Some(owner.to_string()),
            lease_expires_at: Some(expires),
            acquired_at: Some(now),
            last_heartbeat: Some(now),
            hash_range_start: row.range_start as u64,
            hash_range_end: row.range_end as u64,
        })
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ShardRow>(
            "SELECT * FROM history_shards WHERE shard_id = $1 FOR UPDATE",
        )
        .bind(shard_id as i32)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))?;

        let now = Utc::now();
        let is_current_owner = row.owner_identity.as_deref() == Some(owner)
            && row.lease_expires_at.is_some_and(|exp| exp >= now);
        if !is_current_owner {
            return Err(OrchestratorError::ShardUnavailable {
                shard_id,
                reason: "caller is not the current owner".to_string(),
            });
        }

        let expires = now + ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        sqlx::query(
            "UPDATE history_shards SET lease_expires_at = $2, last_heartbeat = $3 \
             WHERE shard_id = $1",
        )
        .bind(shard_id as i32)
        .bind(expires)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Shard {
            shard_id,
            owner_identity: Some(owner.to_string()),
            lease_expires_at: Some(expires),
            acquired_at: row.acquired_at,
            last_heartbeat: Some(now),
            hash_range_start: row.range_start as u64,
            hash_range_end: row.range_end as u64,
        })
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, shard_id: u32, owner: &str) -> Result<(), OrchestratorError> {
        sqlx::query(
            "UPDATE history_shards SET owner_identity = NULL, lease_expires_at = NULL, \
             acquired_at = NULL WHERE shard_id = $1 AND owner_identity = $2",
        )
        .bind(shard_id as i32)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_lease(&self, shard_id: u32) -> Result<Shard, OrchestratorError> {
        let row = sqlx::query_as::<_, ShardRow>("SELECT * FROM history_shards WHERE shard_id = $1")
            .bind(shard_id as i32)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))?;
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn list_owned(&self, owner: &str) -> Result<Vec<Shard>, OrchestratorError> {
        let rows = sqlx::query_as::<_, ShardRow>(
            "SELECT * FROM history_shards WHERE owner_identity = $1 AND lease_expires_at > now()",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Shard>, OrchestratorError> {
        let rows = sqlx::query_as::<_, ShardRow>("SELECT * FROM history_shards ORDER BY shard_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self) -> Result<Vec<u32>, OrchestratorError> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "UPDATE history_shards SET owner_identity = NULL, lease_expires_at = NULL, \
             acquired_at = NULL WHERE lease_expires_at < now() RETURNING shard_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id as u32).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ShardRow {
    shard_id: i32,
    owner_identity: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    acquired_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    range_start: i64,
    range_end: i64,
}

impl From<ShardRow> for Shard {
    fn from(row: ShardRow) -> Self {
        Shard {
            shard_id: row.shard_id as u32,
            owner_identity: row.owner_identity,
            lease_expires_at: row.lease_expires_at,
            acquired_at: row.acquired_at,
            last_heartbeat: row.last_heartbeat,
            hash_range_start: row.range_start as u64,
            hash_range_end: row.range_end as u64,
        }
    }
}

// ---------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryShardRepository {
    shards: RwLock<HashMap<u32, Shard>>,
}

impl InMemoryShardRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShardRepository for InMemoryShardRepository {
    async fn initialize_shards(&self, shard_count: u32) -> Result<(), OrchestratorError> {
        let range_width = (u64::from(u32::MAX) + 1) / u64::from(shard_count).max(1);
        let mut shards = self.shards.write();
        for shard_id in 0..shard_count {
            shards.entry(shard_id).or_insert_with(|| Shard {
                shard_id,
                owner_identity: None,
                lease_expires_at: None,
                acquired_at: None,
                last_heartbeat: None,
                hash_range_start: u64::from(shard_id) * range_width,
                hash_range_end: u64::from(shard_id) * range_width + range_width,
            });
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError> {
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(&shard_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))?;

        let now = Utc::now();
        if !shard.is_unowned(now) {
            return Err(OrchestratorError::ShardUnavailable {
                shard_id,
                reason: format!(
                    "owned by {}",
                    shard.owner_identity.clone().unwrap_or_default()
                ),
            });
        }

        let expires = now + ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        shard.owner_identity = Some(owner.to_string());
        shard.lease_expires_at = Some(expires);
        shard.acquired_at = Some(now);
        shard.last_heartbeat = Some(now);
        Ok(shard.clone())
    }

    async fn renew_lease(
        &self,
        shard_id: u32,
        owner: &str,
        duration: std::time::Duration,
    ) -> Result<Shard, OrchestratorError> {
        let mut shards = self.shards.write();
        let shard = shards
            .get_mut(&shard_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))?;

        let now = Utc::now();
        let is_current_owner = shard.owner_identity.as_deref() == Some(owner)
            && shard.lease_expires_at.is_some_and(|exp| exp >= now);
        if !is_current_owner {
            return Err(OrchestratorError::ShardUnavailable {
                shard_id,
                reason: "caller is not the current owner".to_string(),
            });
        }

        shard.lease_expires_at =
            Some(now + ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero()));
        shard.last_heartbeat = Some(now);
        Ok(shard.clone())
    }

    async fn release_lease(&self, shard_id: u32, owner: &str) -> Result<(), OrchestratorError> {
        let mut shards = self.shards.write();
        if let Some(shard) = shards.get_mut(&shard_id) {
            if shard.owner_identity.as_deref() == Some(owner) {
                shard.owner_identity = None;
                shard.lease_expires_at = None;
                shard.acquired_at = None;
            }
        }
        Ok(())
    }

    async fn get_lease(&self, shard_id: u32) -> Result<Shard, OrchestratorError> {
        self.shards
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("shard {shard_id}")))
    }

    async fn list_owned(&self, owner: &str) -> Result<Vec<Shard>, OrchestratorError> {
        let now = Utc::now();
        Ok(self
            .shards
            .read()
            .values()
            .filter(|s| s.owner_identity.as_deref() == Some(owner) && !s.is_unowned(now))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Shard>, OrchestratorError> {
        let mut all: Vec<Shard> = self.shards.read().values().cloned().collect();
        all.sort_by_key(|s| s.shard_id);
        Ok(all)
    }

    async fn reclaim_expired(&self) -> Result<Vec<u32>, OrchestratorError> {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for shard in self.shards.write().values_mut() {
            if shard.owner_identity.is_some() && shard.is_unowned(now) {
                shard.owner_identity = None;
                shard.lease_expires_at = None;
                shard.acquired_at = None;
                reclaimed.push(shard.shard_id);
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(count: u32) -> InMemoryShardRepository {
        let repo = InMemoryShardRepository::new();
        repo.initialize_shards(count).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn acquire_then_contend() {
        let repo = seeded(4).await;
        repo.acquire_lease(0, "a", std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let err = repo
            .acquire_lease(0, "b", std::time::Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ShardUnavailable { .. }));
    }

    #[tokio::test]
    async fn renew_requires_current_owner() {
        let repo = seeded(1).await;
        repo.acquire_lease(0, "a", std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let err = repo
            .renew_lease(0, "b", std::time::Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ShardUnavailable { .. }));

        repo.renew_lease(0, "a", std::time::Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let repo = seeded(1).await;
        repo.acquire_lease(0, "a", std::time::Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let shard = repo
            .acquire_lease(0, "b", std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(shard.owner_identity.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn reclaim_expired_clears_ownership() {
        let repo = seeded(1).await;
        repo.acquire_lease(0, "a", std::time::Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reclaimed = repo.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, vec![0]);
        let shard = repo.get_lease(0).await.unwrap();
        assert!(shard.owner_identity.is_none());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_noop() {
        let repo = seeded(1).await;
        repo.acquire_lease(0, "a", std::time::Duration::from_secs(30))
            .await
            .unwrap();
        repo.release_lease(0, "b").await.unwrap();

        let shard = repo.get_lease(0).await.unwrap();
        assert_eq!(shard.owner_identity.as_deref(), Some("a"));
    }
}

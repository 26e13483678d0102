//! Shard manager: background acquire/renew/release lease loops, one per
//! owned shard, plus a slow sweeper that reclaims expired leases for
//! observability.
//!
//! Each loop is a standalone `tokio::spawn`ed task gated by a
//! `watch::Receiver<bool>` shutdown signal and a `tokio::time::interval`
//! ticking inside `tokio::select!`; `JoinHandle`s are tracked so shutdown
//! can await them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::persistence::ShardRepository;

/// Configuration for the shard manager's lease lifecycle.
#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    pub shard_count: u32,
    /// Lease duration (`ORCH_LEASE_DURATION_SECONDS`, default 60s).
    pub lease_duration: Duration,
    /// Renewal cadence; should stay well under `lease_duration`, e.g. `D/3`.
    pub renew_interval: Duration,
    /// Cadence of the background expired-lease sweep.
    pub reclaim_interval: Duration,
}

impl Default for ShardManagerConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(60);
        Self {
            shard_count: 512,
            renew_interval: lease_duration / 3,
            lease_duration,
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

impl ShardManagerConfig {
    pub fn new(shard_count: u32, lease_duration: Duration) -> Self {
        Self {
            shard_count,
            lease_duration,
            renew_interval: lease_duration / 3,
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// Owns a set of shard leases on behalf of one server process and keeps
/// them renewed until told to release or the process shuts down.
pub struct ShardManager {
    repo: Arc<dyn ShardRepository>,
    identity: String,
    config: ShardManagerConfig,
    owned: Arc<Mutex<HashMap<u32, ()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardManager {
    pub fn new(repo: Arc<dyn ShardRepository>, identity: impl Into<String>, config: ShardManagerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            repo,
            identity: identity.into(),
            config,
            owned: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The shards this process currently believes it owns. Best-effort —
    /// the authoritative state lives in the repository.
    pub fn owned_shards(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.owned.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Attempt to acquire a single shard's lease and, on success, start its
    /// heartbeat loop. Returns `ShardUnavailable` if another process holds
    /// an unexpired lease.
    #[instrument(skip(self))]
    pub async fn try_acquire(&self, shard_id: u32) -> Result<(), OrchestratorError> {
        self.repo
            .acquire_lease(shard_id, &self.identity, self.config.lease_duration)
            .await?;
        self.owned.lock().insert(shard_id, ());
        self.start_heartbeat_loop(shard_id);
        info!(shard_id, owner = %self.identity, "shard lease acquired");
        Ok(())
    }

    /// Attempt to acquire every shard in `[0, shard_count)` this process
    /// does not yet own. Errors for individual shards are logged and
    /// skipped — contention on one shard must not abort the sweep.
    #[instrument(skip(self))]
    pub async fn acquire_available_shards(&self) {
        for shard_id in 0..self.config.shard_count {
            if self.owned.lock().contains_key(&shard_id) {
                continue;
            }
            match self.try_acquire(shard_id).await {
                Ok(()) => {}
                Err(OrchestratorError::ShardUnavailable { .. }) => {}
                Err(e) => warn!(shard_id, error = %e, "shard acquisition attempt failed"),
            }
        }
    }

    fn start_heartbeat_loop(&self, shard_id: u32) {
        let repo = Arc::clone(&self.repo);
        let identity = self.identity.clone();
        let lease_duration = self.config.lease_duration;
        let renew_interval = self.config.renew_interval;
        let owned = Arc::clone(&self.owned);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match repo.renew_lease(shard_id, &identity, lease_duration).await {
                            Ok(_) => debug!(shard_id, "shard lease renewed"),
                            Err(e) => {
                                warn!(shard_id, error = %e, "shard lease renewal failed, dropping shard");
                                owned.lock().remove(&shard_id);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(shard_id, "heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        });
        self.handles.lock().push(handle);
    }

    /// Start the slow background sweep that clears expired-lease rows for
    /// observability, independent of per-shard heartbeat loops.
    pub fn start_reclaim_sweep(self: &Arc<Self>) {
        let repo = Arc::clone(&self.repo);
        let interval = self.config.reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match repo.reclaim_expired().await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed expired shard leases");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "shard reclaim sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim sweep: shutdown requested");
                        break;
                    }
                }
            }
        });
        self.handles.lock().push(handle);
    }

    /// Release every owned shard (best-effort) and stop all background
    /// loops. Call on graceful shutdown.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let shard_ids = self.owned_shards();
        for shard_id in shard_ids {
            if let Err(e) = self.repo.release_lease(shard_id, &self.identity).await {
                warn!(shard_id, error = %e, "failed to release shard lease on shutdown");
            }
        }
        self.owned.lock().clear();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// True if this process owns `shard_id` per its local cache (not a
    /// repository round-trip). Used by the history/matching services to
    /// fast-path ownership checks before falling back to `get_lease`.
    pub fn owns_locally(&self, shard_id: u32) -> bool {
        self.owned.lock().contains_key(&shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryShardRepository;

    async fn manager(config: ShardManagerConfig) -> (Arc<InMemoryShardRepository>, Arc<ShardManager>) {
        let repo = Arc::new(InMemoryShardRepository::new());
        repo.initialize_shards(config.shard_count).await.unwrap();
        let manager = Arc::new(ShardManager::new(repo.clone(), "node-a", config));
        (repo, manager)
    }

    #[tokio::test]
    async fn acquire_then_owns_locally() {
        let (_, manager) = manager(ShardManagerConfig::new(4, Duration::from_secs(30))).await;
        manager.try_acquire(0).await.unwrap();
        assert!(manager.owns_locally(0));
        assert_eq!(manager.owned_shards(), vec![0]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn contended_shard_yields_unavailable() {
        let repo = Arc::new(InMemoryShardRepository::new());
        repo.initialize_shards(1).await.unwrap();
        let a = Arc::new(ShardManager::new(repo.clone(), "a", ShardManagerConfig::new(1, Duration::from_secs(30))));
        let b = Arc::new(ShardManager::new(repo.clone(), "b", ShardManagerConfig::new(1, Duration::from_secs(30))));

        a.try_acquire(0).await.unwrap();
        let err = b.try_acquire(0).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ShardUnavailable { .. }));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_owned_shards() {
        let (repo, manager) = manager(ShardManagerConfig::new(2, Duration::from_secs(30))).await;
        manager.try_acquire(0).await.unwrap();
        manager.shutdown().await;

        let shard = repo.get_lease(0).await.unwrap();
        assert!(shard.owner_identity.is_none());
    }

    #[tokio::test]
    async fn acquire_available_shards_skips_already_owned() {
        let (_, manager) = manager(ShardManagerConfig::new(3, Duration::from_secs(30))).await;
        manager.acquire_available_shards().await;
        assert_eq!(manager.owned_shards(), vec![0, 1, 2]);
        manager.shutdown().await;
    }
}

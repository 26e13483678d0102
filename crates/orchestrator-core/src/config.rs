//! Runtime configuration, assembled from the environment at process startup.

use std::time::Duration;

/// Process-wide configuration. `from_env()` is the production entry point;
/// the builder methods exist for tests and programmatic wiring.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `ORCH_DB_CONNECTION` — Postgres connection string. `None` runs the
    /// in-memory repositories (single-process only, used for local runs).
    pub db_connection: Option<String>,
    /// `ORCH_SHARD_COUNT`, default 512.
    pub shard_count: u32,
    /// `ORCH_HISTORY_RETENTION_DAYS`, default 30.
    pub history_retention_days: i32,
    /// `ORCH_LEASE_DURATION_SECONDS`, default 60.
    pub lease_duration: Duration,
    /// `ORCH_HEARTBEAT_EXTENSION_SECONDS`, default 60.
    pub heartbeat_extension: Duration,
    /// `ORCH_REQUEUE_DELAY_SECONDS`, default 5. Governs the queue layer's
    /// own backoff; `RetryPolicy` remains separately available to workflow
    /// authors for their own retry decisions.
    pub requeue_delay: Duration,
    /// `ORCH_HTTP_ADDR`, default `0.0.0.0:8080` — admin/operator HTTP surface.
    pub http_addr: String,
    /// `ORCH_RPC_ADDR`, default `0.0.0.0:7233` — worker-facing RPC listener.
    pub rpc_addr: String,
    /// `ORCH_WORKER_CONCURRENCY`, default 10.
    pub worker_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_connection: None,
            shard_count: 512,
            history_retention_days: 30,
            lease_duration: Duration::from_secs(60),
            heartbeat_extension: Duration::from_secs(60),
            requeue_delay: Duration::from_secs(5),
            http_addr: "0.0.0.0:8080".to_string(),
            rpc_addr: "0.0.0.0:7233".to_string(),
            worker_concurrency: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_connection: std::env::var("ORCH_DB_CONNECTION").ok(),
            shard_count: env_u32("ORCH_SHARD_COUNT", defaults.shard_count),
            history_retention_days: env_i32("ORCH_HISTORY_RETENTION_DAYS", defaults.history_retention_days),
            lease_duration: env_secs("ORCH_LEASE_DURATION_SECONDS", defaults.lease_duration),
            heartbeat_extension: env_secs("ORCH_HEARTBEAT_EXTENSION_SECONDS", defaults.heartbeat_extension),
            requeue_delay: env_secs("ORCH_REQUEUE_DELAY_SECONDS", defaults.requeue_delay),
            http_addr: std::env::var("ORCH_HTTP_ADDR").unwrap_or(defaults.http_addr),
            rpc_addr: std::env::var("ORCH_RPC_ADDR").unwrap_or(defaults.rpc_addr),
            worker_concurrency: env_usize("ORCH_WORKER_CONCURRENCY", defaults.worker_concurrency),
        }
    }

    pub fn with_shard_count(mut self, count: u32) -> Self {
        self.shard_count = count;
        self
    }

    pub fn with_db_connection(mut self, conn: impl Into<String>) -> Self {
        self.db_connection = Some(conn.into());
        self
    }

    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency.max(1);
        self
    }

    pub fn with_http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = addr.into();
        self
    }

    pub fn with_rpc_addr(mut self, addr: impl Into<String>) -> Self {
        self.rpc_addr = addr.into();
        self
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.shard_count, 512);
        assert_eq!(config.history_retention_days, 30);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.heartbeat_extension, Duration::from_secs(60));
        assert_eq!(config.requeue_delay, Duration::from_secs(5));
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.rpc_addr, "0.0.0.0:7233");
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = OrchestratorConfig::default()
            .with_shard_count(16)
            .with_worker_concurrency(4)
            .with_http_addr("127.0.0.1:9000");
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.http_addr, "127.0.0.1:9000");
    }

    #[test]
    fn from_env_reads_overrides() {
        std::env::set_var("ORCH_SHARD_COUNT", "8");
        std::env::set_var("ORCH_LEASE_DURATION_SECONDS", "45");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.shard_count, 8);
        assert_eq!(config.lease_duration, Duration::from_secs(45));
        std::env::remove_var("ORCH_SHARD_COUNT");
        std::env::remove_var("ORCH_LEASE_DURATION_SECONDS");
    }
}

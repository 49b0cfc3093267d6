//! Configuration for the sharded store core.

use crate::types::ShardRole;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration for placement and migration.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// How long a cached topology value is considered fresh.
    pub topology_ttl: Duration,

    /// Staleness multiplier: while another caller refreshes a key, a stale
    /// value no older than `topology_ttl + deferment_window()` is served,
    /// where the window is `topology_ttl * deferment_multiplier`.
    pub deferment_multiplier: u32,

    /// Attempts to re-check a contended cache key before giving up.
    pub lock_retry_attempts: u32,

    /// Backoff between contended-cache re-checks.
    pub lock_retry_backoff: Duration,

    /// Virtual replicas per endpoint on the consistent hash ring.
    pub ring_replicas: usize,

    /// Sleep between completion polls when waiting on a dispatched batch.
    pub dispatch_poll_interval: Duration,

    /// Remote call attempts before a transient failure is surfaced.
    pub remote_retry_attempts: u32,

    /// Backoff between remote retries.
    pub remote_retry_backoff: Duration,

    /// Per-request timeout for shard RPCs.
    pub remote_timeout: Duration,

    /// Pool size per role for the fresh pools allocated on promotion.
    pub promotion_pool_sizes: BTreeMap<ShardRole, usize>,

    /// Key prefix of the system subtree moved on promotion.
    pub system_prefix: String,

    /// Root URI for pre-migration backups, e.g. `s3://bucket/backup-dir`.
    pub backup_root: String,
}

impl Default for GridConfig {
    fn default() -> Self {
        let mut promotion_pool_sizes = BTreeMap::new();
        promotion_pool_sizes.insert(ShardRole::Manifest, 1);
        promotion_pool_sizes.insert(ShardRole::Entry, 2);
        promotion_pool_sizes.insert(ShardRole::Index, 2);
        promotion_pool_sizes.insert(ShardRole::FullText, 2);
        promotion_pool_sizes.insert(ShardRole::AllocIds, 1);

        Self {
            topology_ttl: Duration::from_secs(60),
            deferment_multiplier: 2,
            lock_retry_attempts: 10,
            lock_retry_backoff: Duration::from_millis(50),
            ring_replicas: 300,
            dispatch_poll_interval: Duration::from_millis(200),
            remote_retry_attempts: 3,
            remote_retry_backoff: Duration::from_millis(100),
            remote_timeout: Duration::from_secs(30),
            promotion_pool_sizes,
            system_prefix: "__system/".to_string(),
            backup_root: "s3://shardgrid-backup/migrations".to_string(),
        }
    }
}

impl GridConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the topology cache TTL.
    pub fn with_topology_ttl(mut self, ttl: Duration) -> Self {
        self.topology_ttl = ttl;
        self
    }

    /// Set the stale-serve deferment multiplier.
    pub fn with_deferment_multiplier(mut self, multiplier: u32) -> Self {
        self.deferment_multiplier = multiplier.max(1);
        self
    }

    /// Set contended-cache retry attempts and backoff.
    pub fn with_lock_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.lock_retry_attempts = attempts;
        self.lock_retry_backoff = backoff;
        self
    }

    /// Set the number of virtual replicas per ring endpoint.
    pub fn with_ring_replicas(mut self, replicas: usize) -> Self {
        self.ring_replicas = replicas.max(1);
        self
    }

    /// Set the batch-completion poll interval.
    pub fn with_dispatch_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatch_poll_interval = interval;
        self
    }

    /// Set remote retry attempts and backoff.
    pub fn with_remote_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.remote_retry_attempts = attempts.max(1);
        self.remote_retry_backoff = backoff;
        self
    }

    /// Set the per-request shard RPC timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Set the fresh pool size for a role on promotion.
    pub fn with_promotion_pool_size(mut self, role: ShardRole, size: usize) -> Self {
        let size = if role.fixed_pool() { 1 } else { size.max(1) };
        self.promotion_pool_sizes.insert(role, size);
        self
    }

    /// Set the system key prefix moved on promotion.
    pub fn with_system_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.system_prefix = prefix.into();
        self
    }

    /// Set the backup destination root URI.
    pub fn with_backup_root(mut self, root: impl Into<String>) -> Self {
        self.backup_root = root.into();
        self
    }

    /// The deferment window: how much older than the TTL a stale value may
    /// be while another caller holds the refresh lock.
    pub fn deferment_window(&self) -> Duration {
        self.topology_ttl * self.deferment_multiplier
    }

    /// Fresh pool size for a role on promotion.
    pub fn promotion_pool_size(&self, role: ShardRole) -> usize {
        if role.fixed_pool() {
            return 1;
        }
        self.promotion_pool_sizes.get(&role).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GridConfig::default();
        assert_eq!(config.ring_replicas, 300);
        assert_eq!(config.deferment_multiplier, 2);
        assert_eq!(config.promotion_pool_size(ShardRole::Manifest), 1);
    }

    #[test]
    fn test_builder() {
        let config = GridConfig::new()
            .with_topology_ttl(Duration::from_secs(5))
            .with_ring_replicas(64)
            .with_promotion_pool_size(ShardRole::Entry, 4);

        assert_eq!(config.topology_ttl, Duration::from_secs(5));
        assert_eq!(config.ring_replicas, 64);
        assert_eq!(config.promotion_pool_size(ShardRole::Entry), 4);
        assert_eq!(config.deferment_window(), Duration::from_secs(10));
    }

    #[test]
    fn test_manifest_pool_size_is_pinned() {
        let config = GridConfig::new().with_promotion_pool_size(ShardRole::Manifest, 5);
        assert_eq!(config.promotion_pool_size(ShardRole::Manifest), 1);
    }
}

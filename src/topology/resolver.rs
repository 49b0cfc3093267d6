//! Cached resolution of (service, role) -> shard names and
//! (shard, role) -> endpoint.
//!
//! Both lookups go through independent single-flight caches so a refresh of
//! one service's pool list never serializes against endpoint lookups, and
//! vice versa.

use crate::config::GridConfig;
use crate::error::Result;
use crate::topology::cache::SingleFlightCache;
use crate::topology::store::TopologyStore;
use crate::types::ShardRole;
use std::sync::Arc;

/// Resolves shard pools and endpoints against the authoritative registry,
/// with bounded-stale caching.
#[derive(Debug)]
pub struct ShardTopologyResolver {
    store: Arc<dyn TopologyStore>,
    names: SingleFlightCache<(String, ShardRole), Vec<String>>,
    urls: SingleFlightCache<(String, ShardRole), String>,
}

impl ShardTopologyResolver {
    pub fn new(store: Arc<dyn TopologyStore>, config: &GridConfig) -> Self {
        fn make_cache<V: Clone + Send + Sync>(
            config: &GridConfig,
        ) -> SingleFlightCache<(String, ShardRole), V> {
            SingleFlightCache::new(
                config.topology_ttl,
                config.deferment_window(),
                config.lock_retry_attempts,
                config.lock_retry_backoff,
            )
        }
        Self {
            store,
            names: make_cache(config),
            urls: make_cache(config),
        }
    }

    /// Ordered shard names assigned to a service for a role.
    pub async fn shard_names(&self, service: &str, role: ShardRole) -> Result<Vec<String>> {
        let store = Arc::clone(&self.store);
        let service_key = service.to_string();
        self.names
            .get_or_refresh((service_key.clone(), role), || async move {
                let assignment = store.fetch_assignment(&service_key).await?;
                Ok(assignment.value.pool(role).to_vec())
            })
            .await
    }

    /// Network endpoint of a shard for a role.
    pub async fn shard_url(&self, shard: &str, role: ShardRole) -> Result<String> {
        let store = Arc::clone(&self.store);
        let shard_key = shard.to_string();
        self.urls
            .get_or_refresh((shard_key.clone(), role), || async move {
                store.shard_url(&shard_key, role).await
            })
            .await
    }

    /// Resolve every shard name of a pool to its endpoint, preserving order.
    pub async fn endpoints(&self, names: &[String], role: ShardRole) -> Result<Vec<String>> {
        let mut endpoints = Vec::with_capacity(names.len());
        for name in names {
            endpoints.push(self.shard_url(name, role).await?);
        }
        Ok(endpoints)
    }

    /// Unconditionally overwrite the cached pool list for a service/role.
    ///
    /// Called right after a topology change so subsequent lookups see the
    /// new shards without waiting for TTL expiry.
    pub fn invalidate(&self, service: &str, role: ShardRole, names: Vec<String>) {
        self.names.invalidate((service.to_string(), role), names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::store::MemoryTopologyStore;
    use crate::types::{ServiceAssignment, ServiceStatus, TargetStage};
    use std::collections::BTreeMap;

    fn seeded() -> Arc<MemoryTopologyStore> {
        let store = MemoryTopologyStore::new();
        store.register_shard("e1", ShardRole::Entry, "http://e1");
        store.register_shard("e2", ShardRole::Entry, "http://e2");
        let mut pools = BTreeMap::new();
        pools.insert(ShardRole::Manifest, vec!["m1".to_string()]);
        pools.insert(ShardRole::Entry, vec!["e1".to_string(), "e2".to_string()]);
        pools.insert(ShardRole::Index, vec!["i1".to_string()]);
        pools.insert(ShardRole::FullText, vec!["f1".to_string()]);
        pools.insert(ShardRole::AllocIds, vec!["a1".to_string()]);
        store.create_service(
            ServiceAssignment::new("svc", pools),
            ServiceStatus::Target(TargetStage::Production),
            "ns-1",
        );
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_shard_names_and_urls() {
        let store = seeded();
        let resolver = ShardTopologyResolver::new(store, &GridConfig::default());

        let names = resolver.shard_names("svc", ShardRole::Entry).await.unwrap();
        assert_eq!(names, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(
            resolver.shard_url("e1", ShardRole::Entry).await.unwrap(),
            "http://e1"
        );
    }

    #[tokio::test]
    async fn test_invalidate_takes_effect_immediately() {
        let store = seeded();
        let resolver = ShardTopologyResolver::new(store, &GridConfig::default());

        resolver.shard_names("svc", ShardRole::Entry).await.unwrap();
        resolver.invalidate(
            "svc",
            ShardRole::Entry,
            vec!["e1".to_string(), "e2".to_string(), "e3".to_string()],
        );

        // Served from cache, no TTL wait.
        let names = resolver.shard_names("svc", ShardRole::Entry).await.unwrap();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_endpoints_preserve_pool_order() {
        let store = seeded();
        let resolver = ShardTopologyResolver::new(store, &GridConfig::default());
        let endpoints = resolver
            .endpoints(&["e2".to_string(), "e1".to_string()], ShardRole::Entry)
            .await
            .unwrap();
        assert_eq!(endpoints, vec!["http://e2".to_string(), "http://e1".to_string()]);
    }
}

//! Authoritative topology registry.
//!
//! The registry is the durable record of service placement, status, and the
//! active namespace pointer, with optimistic concurrency: every mutation is
//! a revision-checked compare-and-swap, so concurrent orchestrator
//! invocations for the same tenant cannot interleave undetected.

use crate::error::{Error, Result};
use crate::migrate::BackupRecord;
use crate::types::{ServiceAssignment, ServiceStatus, ShardRole, Versioned};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Registry contract used by the resolver and the migration orchestrator.
#[async_trait::async_trait]
pub trait TopologyStore: Send + Sync + std::fmt::Debug {
    /// Load a service's current assignment with its revision.
    async fn fetch_assignment(&self, service: &str) -> Result<Versioned<ServiceAssignment>>;

    /// Revision-checked assignment write. Returns the new revision.
    async fn store_assignment(
        &self,
        assignment: &ServiceAssignment,
        expected_revision: u64,
    ) -> Result<u64>;

    /// Load a service's lifecycle status with its revision.
    async fn fetch_status(&self, service: &str) -> Result<Versioned<ServiceStatus>>;

    /// Revision-checked status write. Returns the new revision.
    async fn cas_status(
        &self,
        service: &str,
        status: ServiceStatus,
        expected_revision: u64,
    ) -> Result<u64>;

    /// Load the active namespace pointer for a service.
    async fn fetch_namespace(&self, service: &str) -> Result<Versioned<String>>;

    /// Revision-checked namespace pointer swap. Returns the new revision.
    async fn cas_namespace(
        &self,
        service: &str,
        namespace: &str,
        expected_revision: u64,
    ) -> Result<u64>;

    /// Resolve a shard name to its network endpoint for a role.
    async fn shard_url(&self, shard: &str, role: ShardRole) -> Result<String>;

    /// All registered shard names for a role, assigned or not.
    async fn assignable_shards(&self, role: ShardRole) -> Result<Vec<String>>;

    /// Persist the pre-change backup record for a service.
    async fn save_backup_record(&self, service: &str, record: &BackupRecord) -> Result<()>;

    /// Load the in-flight backup record, if a migration is pending retry.
    async fn load_backup_record(&self, service: &str) -> Result<Option<BackupRecord>>;

    /// Remove the backup record after a migration fully succeeds.
    async fn delete_backup_record(&self, service: &str) -> Result<()>;
}

/// In-process registry implementation.
///
/// Backs unit and integration tests directly, and serves as the reference
/// semantics for any durable registry adapter.
#[derive(Debug, Default)]
pub struct MemoryTopologyStore {
    inner: RwLock<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    assignments: HashMap<String, (ServiceAssignment, u64)>,
    statuses: HashMap<String, (ServiceStatus, u64)>,
    namespaces: HashMap<String, (String, u64)>,
    shard_urls: HashMap<(String, ShardRole), String>,
    registered: BTreeMap<ShardRole, Vec<String>>,
    backups: HashMap<String, BackupRecord>,
}

impl MemoryTopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard name with its endpoint for a role, making it
    /// eligible for assignment.
    pub fn register_shard(&self, name: impl Into<String>, role: ShardRole, url: impl Into<String>) {
        let name = name.into();
        let mut state = self.inner.write();
        state.shard_urls.insert((name.clone(), role), url.into());
        let pool = state.registered.entry(role).or_default();
        if !pool.contains(&name) {
            pool.push(name);
        }
    }

    /// Seed a service with its initial assignment, status, and namespace.
    pub fn create_service(
        &self,
        assignment: ServiceAssignment,
        status: ServiceStatus,
        namespace: impl Into<String>,
    ) {
        let mut state = self.inner.write();
        let service = assignment.service.clone();
        state.assignments.insert(service.clone(), (assignment, 0));
        state.statuses.insert(service.clone(), (status, 0));
        state.namespaces.insert(service, (namespace.into(), 0));
    }
}

#[async_trait::async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn fetch_assignment(&self, service: &str) -> Result<Versioned<ServiceAssignment>> {
        let state = self.inner.read();
        state
            .assignments
            .get(service)
            .map(|(a, rev)| Versioned::new(a.clone(), *rev))
            .ok_or_else(|| Error::NotFound(format!("assignment for service {service}")))
    }

    async fn store_assignment(
        &self,
        assignment: &ServiceAssignment,
        expected_revision: u64,
    ) -> Result<u64> {
        let mut state = self.inner.write();
        let slot = state
            .assignments
            .get_mut(&assignment.service)
            .ok_or_else(|| Error::NotFound(format!("assignment for service {}", assignment.service)))?;
        if slot.1 != expected_revision {
            return Err(Error::OptimisticConflict {
                expected: expected_revision,
                actual: slot.1,
            });
        }
        slot.0 = assignment.clone();
        slot.1 += 1;
        Ok(slot.1)
    }

    async fn fetch_status(&self, service: &str) -> Result<Versioned<ServiceStatus>> {
        let state = self.inner.read();
        state
            .statuses
            .get(service)
            .map(|(s, rev)| Versioned::new(*s, *rev))
            .ok_or_else(|| Error::NotFound(format!("status for service {service}")))
    }

    async fn cas_status(
        &self,
        service: &str,
        status: ServiceStatus,
        expected_revision: u64,
    ) -> Result<u64> {
        let mut state = self.inner.write();
        let slot = state
            .statuses
            .get_mut(service)
            .ok_or_else(|| Error::NotFound(format!("status for service {service}")))?;
        if slot.1 != expected_revision {
            return Err(Error::OptimisticConflict {
                expected: expected_revision,
                actual: slot.1,
            });
        }
        slot.0 = status;
        slot.1 += 1;
        Ok(slot.1)
    }

    async fn fetch_namespace(&self, service: &str) -> Result<Versioned<String>> {
        let state = self.inner.read();
        state
            .namespaces
            .get(service)
            .map(|(ns, rev)| Versioned::new(ns.clone(), *rev))
            .ok_or_else(|| Error::NotFound(format!("namespace for service {service}")))
    }

    async fn cas_namespace(
        &self,
        service: &str,
        namespace: &str,
        expected_revision: u64,
    ) -> Result<u64> {
        let mut state = self.inner.write();
        let slot = state
            .namespaces
            .get_mut(service)
            .ok_or_else(|| Error::NotFound(format!("namespace for service {service}")))?;
        if slot.1 != expected_revision {
            return Err(Error::OptimisticConflict {
                expected: expected_revision,
                actual: slot.1,
            });
        }
        slot.0 = namespace.to_string();
        slot.1 += 1;
        Ok(slot.1)
    }

    async fn shard_url(&self, shard: &str, role: ShardRole) -> Result<String> {
        let state = self.inner.read();
        state
            .shard_urls
            .get(&(shard.to_string(), role))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("endpoint for {role} shard {shard}")))
    }

    async fn assignable_shards(&self, role: ShardRole) -> Result<Vec<String>> {
        let state = self.inner.read();
        Ok(state.registered.get(&role).cloned().unwrap_or_default())
    }

    async fn save_backup_record(&self, service: &str, record: &BackupRecord) -> Result<()> {
        self.inner
            .write()
            .backups
            .insert(service.to_string(), record.clone());
        Ok(())
    }

    async fn load_backup_record(&self, service: &str) -> Result<Option<BackupRecord>> {
        Ok(self.inner.read().backups.get(service).cloned())
    }

    async fn delete_backup_record(&self, service: &str) -> Result<()> {
        self.inner.write().backups.remove(service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MaintenanceProgress, TargetStage};

    fn seeded() -> MemoryTopologyStore {
        let store = MemoryTopologyStore::new();
        store.register_shard("e1", ShardRole::Entry, "http://e1");
        store.register_shard("e2", ShardRole::Entry, "http://e2");
        let mut pools = BTreeMap::new();
        pools.insert(ShardRole::Manifest, vec!["m1".to_string()]);
        pools.insert(ShardRole::Entry, vec!["e1".to_string()]);
        pools.insert(ShardRole::Index, vec!["i1".to_string()]);
        pools.insert(ShardRole::FullText, vec!["f1".to_string()]);
        pools.insert(ShardRole::AllocIds, vec!["a1".to_string()]);
        store.create_service(
            ServiceAssignment::new("svc", pools),
            ServiceStatus::Target(TargetStage::Production),
            "ns-1",
        );
        store
    }

    #[tokio::test]
    async fn test_cas_status_conflict() {
        let store = seeded();
        let status = store.fetch_status("svc").await.unwrap();
        assert_eq!(status.revision, 0);

        let rev = store
            .cas_status(
                "svc",
                ServiceStatus::Maintenance(MaintenanceProgress::ReassigningTopology),
                0,
            )
            .await
            .unwrap();
        assert_eq!(rev, 1);

        // Stale revision must conflict.
        let err = store
            .cas_status("svc", ServiceStatus::Target(TargetStage::Production), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OptimisticConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_assignment_cas_roundtrip() {
        let store = seeded();
        let current = store.fetch_assignment("svc").await.unwrap();

        let mut updated = current.value.clone();
        updated
            .pools
            .insert(ShardRole::Entry, vec!["e1".to_string(), "e2".to_string()]);
        let rev = store.store_assignment(&updated, current.revision).await.unwrap();
        assert_eq!(rev, 1);

        let reloaded = store.fetch_assignment("svc").await.unwrap();
        assert_eq!(reloaded.value.pool(ShardRole::Entry).len(), 2);
    }

    #[tokio::test]
    async fn test_namespace_pointer_swap() {
        let store = seeded();
        let ns = store.fetch_namespace("svc").await.unwrap();
        assert_eq!(ns.value, "ns-1");
        store.cas_namespace("svc", "ns-2", ns.revision).await.unwrap();
        assert_eq!(store.fetch_namespace("svc").await.unwrap().value, "ns-2");
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let store = MemoryTopologyStore::new();
        assert!(matches!(
            store.fetch_status("nope").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}

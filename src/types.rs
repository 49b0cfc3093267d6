//! Core domain types: shard roles, service status, assignments.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Functional partition of data. Each role has its own independent shard
/// pool and hash ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardRole {
    /// Canonical key -> current-shard-location pointer records. Pool size
    /// is pinned to exactly one shard.
    Manifest,
    /// Primary record bodies.
    Entry,
    /// Secondary index entries.
    Index,
    /// Full-text index entries.
    FullText,
    /// Allocation-id and counter state.
    AllocIds,
}

/// Which phase of a topology-change migration a role belongs to.
///
/// Phase 1 must fully complete before phase 2 starts: index recomputation
/// reads Entry data from its (possibly new) shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationPhase {
    /// Entry and AllocIds.
    DataFirst,
    /// Index and FullText.
    IndexSecond,
}

impl ShardRole {
    /// All roles, in persisted-layout order.
    pub const ALL: [ShardRole; 5] = [
        ShardRole::Manifest,
        ShardRole::Entry,
        ShardRole::Index,
        ShardRole::FullText,
        ShardRole::AllocIds,
    ];

    /// Roles migrated on a topology change, grouped by phase.
    pub fn phase(&self) -> Option<MigrationPhase> {
        match self {
            ShardRole::Entry | ShardRole::AllocIds => Some(MigrationPhase::DataFirst),
            ShardRole::Index | ShardRole::FullText => Some(MigrationPhase::IndexSecond),
            // Manifest is pinned to one shard; it moves only on promotion.
            ShardRole::Manifest => None,
        }
    }

    /// Stable one-letter code used in backup paths and the persisted layout.
    pub fn code(&self) -> &'static str {
        match self {
            ShardRole::Manifest => "m",
            ShardRole::Entry => "e",
            ShardRole::Index => "i",
            ShardRole::FullText => "f",
            ShardRole::AllocIds => "a",
        }
    }

    /// Minimum pool size for this role. A change that would shrink a pool
    /// below this is rejected before any mutation.
    pub fn min_pool_size(&self) -> usize {
        1
    }

    /// Whether this role's pool size is fixed (Manifest is pinned to 1).
    pub fn fixed_pool(&self) -> bool {
        matches!(self, ShardRole::Manifest)
    }
}

impl std::fmt::Display for ShardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRole::Manifest => write!(f, "manifest"),
            ShardRole::Entry => write!(f, "entry"),
            ShardRole::Index => write!(f, "index"),
            ShardRole::FullText => write!(f, "fulltext"),
            ShardRole::AllocIds => write!(f, "allocids"),
        }
    }
}

/// Deployment stage of a tenant service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStage {
    Production,
    Staging,
}

impl std::fmt::Display for TargetStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetStage::Production => write!(f, "production"),
            TargetStage::Staging => write!(f, "staging"),
        }
    }
}

/// How far a topology change has proceeded. Used for crash-safe resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MaintenanceProgress {
    /// No maintenance step has completed.
    None,
    /// Topology reassignment is done (or in flight).
    ReassigningTopology,
    /// Data migration has started.
    MigratingData,
}

impl std::fmt::Display for MaintenanceProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceProgress::None => write!(f, "none"),
            MaintenanceProgress::ReassigningTopology => write!(f, "reassigning_topology"),
            MaintenanceProgress::MigratingData => write!(f, "migrating_data"),
        }
    }
}

/// Lifecycle status of a tenant service.
///
/// Created at tenant creation, mutated only by the migration orchestrator
/// via revision-checked compare-and-swap. Terminal success returns to
/// `Target`; terminal failure is `MaintenanceFailure` with the last
/// completed progress recorded, from which a retry can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Serving normally at the given stage.
    Target(TargetStage),
    /// A topology change or promotion is in flight.
    Maintenance(MaintenanceProgress),
    /// A topology change failed; progress marks where to resume.
    MaintenanceFailure(MaintenanceProgress),
}

impl ServiceStatus {
    /// Whether a new orchestration may start from this status.
    pub fn accepts_maintenance(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Target(_) | ServiceStatus::MaintenanceFailure(_)
        )
    }

    /// The progress recorded on this status, if any.
    pub fn progress(&self) -> MaintenanceProgress {
        match self {
            ServiceStatus::Target(_) => MaintenanceProgress::None,
            ServiceStatus::Maintenance(p) | ServiceStatus::MaintenanceFailure(p) => *p,
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Target(stage) => write!(f, "target({stage})"),
            ServiceStatus::Maintenance(p) => write!(f, "maintenance({p})"),
            ServiceStatus::MaintenanceFailure(p) => write!(f, "maintenance_failure({p})"),
        }
    }
}

/// Durable record of a service's current placement: role -> ordered shard
/// names.
///
/// The active storage namespace is a separate pointer record in the
/// registry, so promotion can swap it atomically after data has landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssignment {
    /// Tenant service name.
    pub service: String,
    /// Ordered shard names per role.
    pub pools: BTreeMap<ShardRole, Vec<String>>,
}

impl ServiceAssignment {
    /// Create an assignment with the given pools.
    pub fn new(service: impl Into<String>, pools: BTreeMap<ShardRole, Vec<String>>) -> Self {
        Self {
            service: service.into(),
            pools,
        }
    }

    /// Shard names for a role, empty if the role has no pool.
    pub fn pool(&self, role: ShardRole) -> &[String] {
        self.pools.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Validate the pool-size invariants.
    pub fn validate(&self) -> Result<()> {
        for role in ShardRole::ALL {
            let size = self.pool(role).len();
            if role.fixed_pool() && size != 1 {
                return Err(Error::InvalidRequest(format!(
                    "{role} pool must hold exactly one shard, has {size}"
                )));
            }
            if size < role.min_pool_size() {
                return Err(Error::InvalidRequest(format!(
                    "{role} pool must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// A value loaded from the authoritative registry together with its
/// revision, for optimistic-concurrency writes.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, revision: u64) -> Self {
        Self { value, revision }
    }
}

/// Per-request routing context carried on every shard RPC as headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Tenant service name.
    pub service: String,
    /// Storage namespace the request operates in.
    pub namespace: String,
}

impl RequestContext {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
        }
    }
}

/// Requested change for one role in an add/remove trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolChange {
    /// The orchestrator picks this many names from the assignable pool.
    Count(usize),
    /// Explicit shard names.
    Names(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment_with(entry: &[&str], manifest: &[&str]) -> ServiceAssignment {
        let mut pools = BTreeMap::new();
        pools.insert(
            ShardRole::Manifest,
            manifest.iter().map(|s| s.to_string()).collect(),
        );
        pools.insert(
            ShardRole::Entry,
            entry.iter().map(|s| s.to_string()).collect(),
        );
        pools.insert(ShardRole::Index, vec!["i1".into()]);
        pools.insert(ShardRole::FullText, vec!["f1".into()]);
        pools.insert(ShardRole::AllocIds, vec!["a1".into()]);
        ServiceAssignment::new("svc", pools)
    }

    #[test]
    fn test_validate_ok() {
        assert!(assignment_with(&["e1", "e2"], &["m1"]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let err = assignment_with(&[], &["m1"]).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_validate_rejects_multi_manifest() {
        let err = assignment_with(&["e1"], &["m1", "m2"]).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_status_accepts_maintenance() {
        assert!(ServiceStatus::Target(TargetStage::Production).accepts_maintenance());
        assert!(
            ServiceStatus::MaintenanceFailure(MaintenanceProgress::MigratingData)
                .accepts_maintenance()
        );
        assert!(!ServiceStatus::Maintenance(MaintenanceProgress::ReassigningTopology)
            .accepts_maintenance());
    }

    #[test]
    fn test_role_phases() {
        assert_eq!(ShardRole::Entry.phase(), Some(MigrationPhase::DataFirst));
        assert_eq!(ShardRole::AllocIds.phase(), Some(MigrationPhase::DataFirst));
        assert_eq!(ShardRole::Index.phase(), Some(MigrationPhase::IndexSecond));
        assert_eq!(ShardRole::FullText.phase(), Some(MigrationPhase::IndexSecond));
        assert_eq!(ShardRole::Manifest.phase(), None);
    }

    #[test]
    fn test_status_roundtrip() {
        let status = ServiceStatus::MaintenanceFailure(MaintenanceProgress::MigratingData);
        let bytes = bincode::serialize(&status).unwrap();
        let decoded: ServiceStatus = bincode::deserialize(&bytes).unwrap();
        assert_eq!(status, decoded);
    }
}

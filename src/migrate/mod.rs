//! Shard migration: the per-role migrators and the orchestrating state
//! machine that sequences backup, topology reassignment, and two-phase
//! data movement.

pub mod alloc;
pub mod backup;
pub mod entry;
pub mod index;
pub mod manifest;
pub mod orchestrator;

pub use alloc::{AllocIdMigrator, CounterMigrator};
pub use backup::BackupRecord;
pub use entry::{EntryMigrator, IndexRefresher, NoopIndexRefresher};
pub use index::{IndexComputer, IndexMigrator, RingIndexRefresher};
pub use manifest::{ManifestMigrator, SubtreeMigrator};
pub use orchestrator::MigrationOrchestrator;

use crate::error::Result;
use crate::ring::ConsistentHashRing;
use crate::types::{RequestContext, ShardRole};
use std::sync::Arc;

/// Keys listed per page while scanning a source shard.
pub const MIGRATION_PAGE_SIZE: usize = 500;

/// One unit of migration work: a single source shard of one role, with the
/// placement before and after the topology change.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    /// Role being migrated.
    pub role: ShardRole,
    /// Endpoint of the old shard whose keys are being re-evaluated.
    pub source: String,
    /// Placement before the change. Decides what this source actually held.
    pub old_ring: Arc<ConsistentHashRing>,
    /// Placement after the change. Decides where each key belongs now.
    pub new_ring: Arc<ConsistentHashRing>,
    /// Context for reads from the source shard.
    pub source_ctx: RequestContext,
    /// Context for writes to destination shards. Differs from `source_ctx`
    /// only during a namespace promotion.
    pub dest_ctx: RequestContext,
    /// Restrict the scan to keys under this prefix. Empty scans everything.
    pub key_prefix: String,
    /// Whether moved keys are deleted from the source. Promotion copies
    /// leave the old namespace intact until the pointer swap.
    pub delete_source: bool,
}

impl MigrationJob {
    /// Job for a scale-out/in change: same namespace, full key range,
    /// source copies removed after landing.
    pub fn topology_change(
        role: ShardRole,
        source: impl Into<String>,
        old_ring: Arc<ConsistentHashRing>,
        new_ring: Arc<ConsistentHashRing>,
        ctx: RequestContext,
    ) -> Self {
        Self {
            role,
            source: source.into(),
            old_ring,
            new_ring,
            source_ctx: ctx.clone(),
            dest_ctx: ctx,
            key_prefix: String::new(),
            delete_source: true,
        }
    }

    /// Job for a namespace promotion: copy the prefixed subtree into the
    /// new namespace's pools without touching the source.
    pub fn namespace_copy(
        role: ShardRole,
        source: impl Into<String>,
        old_ring: Arc<ConsistentHashRing>,
        new_ring: Arc<ConsistentHashRing>,
        source_ctx: RequestContext,
        dest_ctx: RequestContext,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            role,
            source: source.into(),
            old_ring,
            new_ring,
            source_ctx,
            dest_ctx,
            key_prefix: key_prefix.into(),
            delete_source: false,
        }
    }
}

/// Operation counts from one migration unit.
///
/// A re-run over an already-migrated shard must report zero copies and
/// deletes; tests assert exactly that.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Records or index-entry copies written to a destination.
    pub copied: u64,
    /// Source-side deletions.
    pub deleted: u64,
    /// Records skipped because they vanished mid-migration.
    pub skipped: u64,
    /// Keys (or entries) that stayed on the source.
    pub retained: u64,
}

impl MigrationOutcome {
    /// Whether the unit performed any data movement.
    pub fn moved_anything(&self) -> bool {
        self.copied > 0 || self.deleted > 0
    }

    /// Fold another unit's counts into this one.
    pub fn merge(&mut self, other: MigrationOutcome) {
        self.copied += other.copied;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.retained += other.retained;
    }
}

/// Per-role migration protocol: "does this key now belong to a different
/// shard, and if so, copy and delete". Invoked once per *old* shard.
#[async_trait::async_trait]
pub trait ShardMigrator: Send + Sync + std::fmt::Debug {
    async fn migrate(&self, job: &MigrationJob) -> Result<MigrationOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_merge() {
        let mut a = MigrationOutcome {
            copied: 2,
            deleted: 1,
            skipped: 0,
            retained: 5,
        };
        a.merge(MigrationOutcome {
            copied: 1,
            deleted: 1,
            skipped: 3,
            retained: 0,
        });
        assert_eq!(a.copied, 3);
        assert_eq!(a.deleted, 2);
        assert_eq!(a.skipped, 3);
        assert_eq!(a.retained, 5);
        assert!(a.moved_anything());
    }

    #[test]
    fn test_job_constructors() {
        let ring = Arc::new(crate::ring::ConsistentHashRing::build(
            &["http://e1".to_string()],
            16,
        ));
        let ctx = RequestContext::new("svc", "ns-1");

        let job = MigrationJob::topology_change(
            ShardRole::Entry,
            "http://e1",
            Arc::clone(&ring),
            Arc::clone(&ring),
            ctx.clone(),
        );
        assert!(job.delete_source);
        assert!(job.key_prefix.is_empty());
        assert_eq!(job.source_ctx, job.dest_ctx);

        let copy = MigrationJob::namespace_copy(
            ShardRole::Manifest,
            "http://e1",
            Arc::clone(&ring),
            ring,
            ctx,
            RequestContext::new("svc", "ns-2"),
            "__system/",
        );
        assert!(!copy.delete_source);
        assert_eq!(copy.key_prefix, "__system/");
    }
}

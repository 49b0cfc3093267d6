//! Pre-change backup snapshots.
//!
//! A snapshot is written before any mutation of a service's placement and
//! deleted only after the migration fully succeeds. On failure it is the
//! source of truth for the retry: the resume path replays data migration
//! against the assignment captured here instead of re-running topology
//! reassignment.

use crate::error::Result;
use crate::remote::{RequestContext, ShardTransport};
use crate::topology::ShardTopologyResolver;
use crate::types::{ServiceAssignment, ShardRole, TargetStage};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Persisted record of the pre-change placement, stored through the
/// topology registry under the service's `previous_backup` subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Tenant service.
    pub service: String,
    /// Stage the service will return to on success.
    pub stage: TargetStage,
    /// Namespace active when the snapshot was taken.
    pub namespace: String,
    /// The pre-change assignment. The resume path treats this as the "old"
    /// side of every ring comparison.
    pub assignment: ServiceAssignment,
    /// Snapshot timestamp, `yyyyMMddHHmmss` UTC. Also names the remote dump
    /// tree for this attempt.
    pub taken_at: String,
    /// Unique id of this migration attempt.
    pub attempt_id: Uuid,
}

impl BackupRecord {
    /// Capture a snapshot of the current placement.
    pub fn capture(
        stage: TargetStage,
        namespace: impl Into<String>,
        assignment: &ServiceAssignment,
    ) -> Self {
        Self {
            service: assignment.service.clone(),
            stage,
            namespace: namespace.into(),
            assignment: assignment.clone(),
            taken_at: Utc::now().format("%Y%m%d%H%M%S").to_string(),
            attempt_id: Uuid::new_v4(),
        }
    }

    /// Remote dump destination for one shard:
    /// `<root>/<stage>/<timestamp>/<namespace>/<role-code>/<shard>`.
    pub fn dump_uri(&self, backup_root: &str, role: ShardRole, shard: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            backup_root.trim_end_matches('/'),
            self.stage,
            self.taken_at,
            self.namespace,
            role.code(),
            shard
        )
    }
}

/// Request a full remote dump of every shard in the snapshot's assignment.
///
/// Runs synchronously and propagates the first failure: without a complete
/// backup the orchestrator must not mutate placement.
pub async fn dump_all_shards(
    transport: &Arc<dyn ShardTransport>,
    resolver: &ShardTopologyResolver,
    record: &BackupRecord,
    backup_root: &str,
) -> Result<()> {
    let ctx = RequestContext::new(&record.service, &record.namespace);
    for role in ShardRole::ALL {
        for shard in record.assignment.pool(role) {
            let endpoint = resolver.shard_url(shard, role).await?;
            let dest = record.dump_uri(backup_root, role, shard);
            tracing::info!(
                service = %record.service,
                %role,
                shard = %shard,
                dest = %dest,
                "requesting shard backup"
            );
            transport.backup_shard(&ctx, &endpoint, role, &dest).await?;
        }
    }
    Ok(())
}

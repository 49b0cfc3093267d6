//! Raw subtree migration.
//!
//! Copies every record under a key prefix to its new-ring owner, optionally
//! deleting the source copy. This is how the manifest moves on promotion,
//! and how the system-prefixed subtree of every record-bearing role is
//! carried into a new namespace.

use crate::error::{Error, Result};
use crate::migrate::{MigrationJob, MigrationOutcome, ShardMigrator, MIGRATION_PAGE_SIZE};
use crate::remote::ShardTransport;
use std::sync::Arc;

/// Prefix-scoped record copier. No manifest updates, no index refresh.
#[derive(Debug)]
pub struct SubtreeMigrator {
    transport: Arc<dyn ShardTransport>,
    page_size: usize,
}

/// On promotion the manifest role is moved with a plain subtree copy.
pub type ManifestMigrator = SubtreeMigrator;

impl SubtreeMigrator {
    pub fn new(transport: Arc<dyn ShardTransport>) -> Self {
        Self {
            transport,
            page_size: MIGRATION_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait::async_trait]
impl ShardMigrator for SubtreeMigrator {
    async fn migrate(&self, job: &MigrationJob) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .transport
                .list_keys(
                    &job.source_ctx,
                    &job.source,
                    job.role,
                    &job.key_prefix,
                    cursor.as_deref(),
                    self.page_size,
                )
                .await?;
            for key in &page.keys {
                let dest = job
                    .new_ring
                    .assign(key)
                    .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?
                    .to_string();
                if dest == job.source && job.source_ctx == job.dest_ctx {
                    outcome.retained += 1;
                    continue;
                }

                let body = match self
                    .transport
                    .fetch_record(&job.source_ctx, &job.source, job.role, key)
                    .await
                {
                    Ok(body) => body,
                    Err(e) if e.is_skippable() => {
                        outcome.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                self.transport
                    .store_record(&job.dest_ctx, &dest, job.role, key, body)
                    .await?;
                outcome.copied += 1;
                if job.delete_source {
                    self.transport
                        .delete_record(&job.source_ctx, &job.source, job.role, key)
                        .await?;
                    outcome.deleted += 1;
                }
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(
            source = %job.source,
            role = %job.role,
            prefix = %job.key_prefix,
            copied = outcome.copied,
            "subtree migrated"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ConsistentHashRing;
    use crate::testing::MemoryShardCluster;
    use crate::types::{RequestContext, ShardRole};

    #[tokio::test]
    async fn test_namespace_copy_leaves_source_intact() {
        let cluster = Arc::new(MemoryShardCluster::new());
        let ring = Arc::new(ConsistentHashRing::build(&["http://m1".to_string()], 64));
        let new_ring = Arc::new(ConsistentHashRing::build(&["http://m2".to_string()], 64));

        for i in 0..10 {
            cluster.put_record(
                "ns-old",
                "http://m1",
                ShardRole::Manifest,
                &format!("__system/cfg-{i}"),
                b"v",
            );
        }
        // Keys outside the prefix must not be copied.
        cluster.put_record("ns-old", "http://m1", ShardRole::Manifest, "user/x", b"v");

        let job = MigrationJob::namespace_copy(
            ShardRole::Manifest,
            "http://m1",
            ring,
            new_ring,
            RequestContext::new("svc", "ns-old"),
            RequestContext::new("svc", "ns-new"),
            "__system/",
        );

        let migrator =
            SubtreeMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>).with_page_size(3);
        let outcome = migrator.migrate(&job).await.unwrap();

        assert_eq!(outcome.copied, 10);
        assert_eq!(outcome.deleted, 0);
        for i in 0..10 {
            let key = format!("__system/cfg-{i}");
            assert!(cluster
                .record("ns-old", "http://m1", ShardRole::Manifest, &key)
                .is_some());
            assert!(cluster
                .record("ns-new", "http://m2", ShardRole::Manifest, &key)
                .is_some());
        }
        assert!(cluster
            .record("ns-new", "http://m2", ShardRole::Manifest, "user/x")
            .is_none());
    }

    #[tokio::test]
    async fn test_same_namespace_copy_to_same_owner_retains() {
        let cluster = Arc::new(MemoryShardCluster::new());
        let ring = Arc::new(ConsistentHashRing::build(&["http://m1".to_string()], 64));
        cluster.put_record("ns-1", "http://m1", ShardRole::Manifest, "__system/a", b"v");

        let mut job = MigrationJob::namespace_copy(
            ShardRole::Manifest,
            "http://m1",
            Arc::clone(&ring),
            ring,
            RequestContext::new("svc", "ns-1"),
            RequestContext::new("svc", "ns-1"),
            "__system/",
        );
        job.delete_source = false;

        let outcome = SubtreeMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>)
            .migrate(&job)
            .await
            .unwrap();
        assert_eq!(outcome.retained, 1);
        assert_eq!(outcome.copied, 0);
    }
}

//! Entry-record migration.
//!
//! Walks every key on the source shard, compares old and new ring
//! placement, and moves records whose owner changed. Each move also updates
//! the manifest pointer synchronously and schedules an index recomputation
//! for the moved record in the background.

use crate::dispatch::{ErrorSink, TaskDispatcher};
use crate::error::{Error, Result};
use crate::migrate::{MigrationJob, MigrationOutcome, ShardMigrator, MIGRATION_PAGE_SIZE};
use crate::remote::ShardTransport;
use crate::types::ShardRole;
use bytes::Bytes;
use std::sync::Arc;

/// Recomputes and re-stores the index entries derived from one record.
///
/// The entry migrator fires this after each moved record without awaiting
/// the result; failures surface through the dispatcher's error sink and the
/// second migration phase re-places index entries anyway.
#[async_trait::async_trait]
pub trait IndexRefresher: Send + Sync + std::fmt::Debug {
    async fn refresh(&self, ancestor: &str) -> Result<()>;
}

/// Refresher that does nothing. For migrations where index placement is
/// handled entirely by the index phase.
#[derive(Debug, Default, Clone)]
pub struct NoopIndexRefresher;

#[async_trait::async_trait]
impl IndexRefresher for NoopIndexRefresher {
    async fn refresh(&self, _ancestor: &str) -> Result<()> {
        Ok(())
    }
}

/// Migrator for `ShardRole::Entry` records.
pub struct EntryMigrator {
    transport: Arc<dyn ShardTransport>,
    dispatcher: TaskDispatcher,
    refresher: Arc<dyn IndexRefresher>,
    manifest_endpoint: String,
    page_size: usize,
    refresh_sink: ErrorSink,
}

impl std::fmt::Debug for EntryMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryMigrator")
            .field("manifest_endpoint", &self.manifest_endpoint)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl EntryMigrator {
    pub fn new(
        transport: Arc<dyn ShardTransport>,
        dispatcher: TaskDispatcher,
        refresher: Arc<dyn IndexRefresher>,
        manifest_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            refresher,
            manifest_endpoint: manifest_endpoint.into(),
            page_size: MIGRATION_PAGE_SIZE,
            refresh_sink: Arc::new(|_| {}),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_refresh_sink(mut self, sink: ErrorSink) -> Self {
        self.refresh_sink = sink;
        self
    }

    async fn migrate_key(
        &self,
        job: &MigrationJob,
        key: &str,
        outcome: &mut MigrationOutcome,
    ) -> Result<()> {
        let dest = job
            .new_ring
            .assign(key)
            .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?
            .to_string();
        if dest == job.source {
            outcome.retained += 1;
            return Ok(());
        }

        let body = match self
            .transport
            .fetch_record(&job.source_ctx, &job.source, job.role, key)
            .await
        {
            Ok(body) => body,
            Err(e) if e.is_skippable() => {
                tracing::debug!(key, source = %job.source, "record vanished mid-migration");
                outcome.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.transport
            .store_record(&job.dest_ctx, &dest, job.role, key, body)
            .await?;
        outcome.copied += 1;

        // The manifest pointer must land before the source copy disappears,
        // so readers chasing a stale ring still find the record.
        self.transport
            .store_record(
                &job.dest_ctx,
                &self.manifest_endpoint,
                ShardRole::Manifest,
                key,
                Bytes::from(dest.clone()),
            )
            .await?;

        if job.delete_source {
            self.transport
                .delete_record(&job.source_ctx, &job.source, job.role, key)
                .await?;
            outcome.deleted += 1;
        }

        let refresher = Arc::clone(&self.refresher);
        let ancestor = key.to_string();
        self.dispatcher.submit_supervised(
            format!("index-refresh:{key}"),
            async move { refresher.refresh(&ancestor).await },
            Arc::clone(&self.refresh_sink),
        );

        Ok(())
    }
}

#[async_trait::async_trait]
impl ShardMigrator for EntryMigrator {
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
                self.migrate_key(job, key, &mut outcome).await?;
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(
            source = %job.source,
            copied = outcome.copied,
            deleted = outcome.deleted,
            retained = outcome.retained,
            "entry shard migrated"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ConsistentHashRing;
    use crate::testing::MemoryShardCluster;
    use crate::types::RequestContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IndexRefresher for CountingRefresher {
        async fn refresh(&self, _ancestor: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn rings() -> (Arc<ConsistentHashRing>, Arc<ConsistentHashRing>) {
        let old = Arc::new(ConsistentHashRing::build(&["http://e1".to_string()], 64));
        let new = Arc::new(ConsistentHashRing::build(
            &["http://e1".to_string(), "http://e2".to_string()],
            64,
        ));
        (old, new)
    }

    fn migrator(
        cluster: &Arc<MemoryShardCluster>,
        refresher: Arc<dyn IndexRefresher>,
    ) -> EntryMigrator {
        EntryMigrator::new(
            Arc::clone(cluster) as Arc<dyn ShardTransport>,
            TaskDispatcher::new(Duration::from_millis(5)),
            refresher,
            "http://m1",
        )
        .with_page_size(3)
    }

    #[tokio::test]
    async fn test_moved_records_land_with_manifest_update() {
        let cluster = Arc::new(MemoryShardCluster::new());
        let ctx = RequestContext::new("svc", "ns-1");
        for i in 0..20 {
            cluster.put_record("ns-1", "http://e1", ShardRole::Entry, &format!("k{i}"), b"v");
        }

        let refresher = Arc::new(CountingRefresher::default());
        let (old, new) = rings();
        let job = MigrationJob::topology_change(
            ShardRole::Entry,
            "http://e1",
            old,
            Arc::clone(&new),
            ctx,
        );

        let outcome = migrator(&cluster, Arc::clone(&refresher) as _)
            .migrate(&job)
            .await
            .unwrap();

        assert_eq!(outcome.copied + outcome.retained, 20);
        assert!(outcome.copied > 0, "ring growth must move something");
        assert_eq!(outcome.deleted, outcome.copied);

        for i in 0..20 {
            let key = format!("k{i}");
            let owner = new.assign(&key).unwrap().to_string();
            assert!(cluster
                .record("ns-1", &owner, ShardRole::Entry, &key)
                .is_some());
            if owner != "http://e1" {
                // Moved off the source, with the manifest repointed.
                assert!(cluster
                    .record("ns-1", "http://e1", ShardRole::Entry, &key)
                    .is_none());
                assert_eq!(
                    cluster.record("ns-1", "http://m1", ShardRole::Manifest, &key),
                    Some(owner.into_bytes())
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(refresher.calls.load(Ordering::Acquire) as u64, outcome.copied);
    }

    #[tokio::test]
    async fn test_rerun_is_a_no_op() {
        let cluster = Arc::new(MemoryShardCluster::new());
        let ctx = RequestContext::new("svc", "ns-1");
        for i in 0..20 {
            cluster.put_record("ns-1", "http://e1", ShardRole::Entry, &format!("k{i}"), b"v");
        }

        let (old, new) = rings();
        let job = MigrationJob::topology_change(
            ShardRole::Entry,
            "http://e1",
            old,
            new,
            ctx,
        );
        let m = migrator(&cluster, Arc::new(NoopIndexRefresher));

        m.migrate(&job).await.unwrap();
        let second = m.migrate(&job).await.unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.deleted, 0);
    }

    #[tokio::test]
    async fn test_prefix_limits_the_scan() {
        let cluster = Arc::new(MemoryShardCluster::new());
        let ctx = RequestContext::new("svc", "ns-1");
        cluster.put_record("ns-1", "http://e1", ShardRole::Entry, "sys/a", b"v");
        cluster.put_record("ns-1", "http://e1", ShardRole::Entry, "user/b", b"v");

        let (old, new) = rings();
        let mut job = MigrationJob::topology_change(
            ShardRole::Entry,
            "http://e1",
            old,
            new,
            ctx,
        );
        job.key_prefix = "sys/".to_string();

        let outcome = migrator(&cluster, Arc::new(NoopIndexRefresher))
            .migrate(&job)
            .await
            .unwrap();
        assert_eq!(outcome.copied + outcome.retained, 1);
    }
}

//! Allocation-id and counter migration.
//!
//! Both live on `ShardRole::AllocIds` shards. The id pool routes by the
//! service name, counters route individually by counter name. Id transfer is
//! a drain-and-grant: the pull empties the source pool, so a re-run finds
//! nothing left to move and double-granting is impossible.

use crate::error::{Error, Result};
use crate::migrate::{MigrationJob, MigrationOutcome, ShardMigrator};
use crate::remote::ShardTransport;
use std::sync::Arc;

/// Migrator for the per-service allocation-id pool.
#[derive(Debug)]
pub struct AllocIdMigrator {
    transport: Arc<dyn ShardTransport>,
}

impl AllocIdMigrator {
    pub fn new(transport: Arc<dyn ShardTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl ShardMigrator for AllocIdMigrator {
    async fn migrate(&self, job: &MigrationJob) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();
        let routing_key = &job.dest_ctx.service;

        // The pool lives on exactly one shard of the pool. Only the old
        // owner has anything to hand over.
        if job.old_ring.assign(routing_key) != Some(job.source.as_str()) {
            return Ok(outcome);
        }
        let dest = job
            .new_ring
            .assign(routing_key)
            .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?
            .to_string();
        if dest == job.source && job.source_ctx == job.dest_ctx {
            outcome.retained += 1;
            return Ok(outcome);
        }

        let polled = self
            .transport
            .poll_alloc_count(&job.source_ctx, &job.source)
            .await?;
        if polled == 0 {
            // Already drained, nothing to transfer.
            return Ok(outcome);
        }
        // The pull itself consumed one id.
        let transferable = polled - 1;
        if transferable > 0 {
            self.transport
                .grant_ids(&job.dest_ctx, &dest, transferable)
                .await?;
            outcome.copied += 1;
        }
        tracing::info!(
            source = %job.source,
            dest = %dest,
            polled,
            transferable,
            "allocation-id pool transferred"
        );
        Ok(outcome)
    }
}

/// Migrator for named counters.
#[derive(Debug)]
pub struct CounterMigrator {
    transport: Arc<dyn ShardTransport>,
}

impl CounterMigrator {
    pub fn new(transport: Arc<dyn ShardTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl ShardMigrator for CounterMigrator {
    async fn migrate(&self, job: &MigrationJob) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();
        let names = self
            .transport
            .list_counters(&job.source_ctx, &job.source)
            .await?;

        for name in names {
            let dest = job
                .new_ring
                .assign(&name)
                .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?
                .to_string();
            if dest == job.source && job.source_ctx == job.dest_ctx {
                outcome.retained += 1;
                continue;
            }

            let state = match self
                .transport
                .fetch_counter(&job.source_ctx, &job.source, &name)
                .await
            {
                Ok(state) => state,
                Err(e) if e.is_skippable() => {
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.transport
                .store_counter(&job.dest_ctx, &dest, &name, state)
                .await?;
            outcome.copied += 1;
            if job.delete_source {
                self.transport
                    .delete_counter(&job.source_ctx, &job.source, &name)
                    .await?;
                outcome.deleted += 1;
            }
        }

        tracing::info!(
            source = %job.source,
            copied = outcome.copied,
            deleted = outcome.deleted,
            "counters migrated"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CounterState;
    use crate::ring::ConsistentHashRing;
    use crate::testing::MemoryShardCluster;
    use crate::types::{RequestContext, ShardRole};

    const A1: &str = "http://a1";
    const A2: &str = "http://a2";

    fn job_for(service: &str) -> MigrationJob {
        let old = Arc::new(ConsistentHashRing::build(&[A1.to_string()], 64));
        let new = Arc::new(ConsistentHashRing::build(
            &[A1.to_string(), A2.to_string()],
            64,
        ));
        MigrationJob::topology_change(
            ShardRole::AllocIds,
            A1,
            old,
            new,
            RequestContext::new(service, "ns-1"),
        )
    }

    /// Service name the grown ring routes away from a1.
    fn moving_service(job_builder: impl Fn(&str) -> MigrationJob) -> (String, MigrationJob) {
        for i in 0..1000 {
            let service = format!("svc-{i}");
            let job = job_builder(&service);
            if job.new_ring.assign(&service) == Some(A2) {
                return (service, job);
            }
        }
        panic!("no service name routed to the added shard");
    }

    #[tokio::test]
    async fn test_id_pool_drain_and_grant() {
        let (_service, job) = moving_service(job_for);
        let cluster = Arc::new(MemoryShardCluster::new());
        cluster.set_alloc_count("ns-1", A1, 100);

        let migrator = AllocIdMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>);
        let outcome = migrator.migrate(&job).await.unwrap();

        assert_eq!(outcome.copied, 1);
        assert_eq!(cluster.alloc_count("ns-1", A1), 0);
        // One id was consumed by the pull itself.
        assert_eq!(cluster.alloc_count("ns-1", A2), 99);
    }

    #[tokio::test]
    async fn test_id_pool_rerun_grants_nothing() {
        let (_service, job) = moving_service(job_for);
        let cluster = Arc::new(MemoryShardCluster::new());
        cluster.set_alloc_count("ns-1", A1, 100);

        let migrator = AllocIdMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>);
        migrator.migrate(&job).await.unwrap();
        let second = migrator.migrate(&job).await.unwrap();

        assert_eq!(second.copied, 0);
        assert_eq!(cluster.alloc_count("ns-1", A2), 99);
    }

    #[tokio::test]
    async fn test_non_owner_shard_does_not_touch_the_pool() {
        let (_service, mut job) = moving_service(job_for);
        // Pretend the unit runs against a source that never owned the pool.
        job.source = A2.to_string();
        let cluster = Arc::new(MemoryShardCluster::new());
        cluster.set_alloc_count("ns-1", A1, 100);

        let migrator = AllocIdMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>);
        let outcome = migrator.migrate(&job).await.unwrap();

        assert_eq!(outcome, MigrationOutcome::default());
        assert_eq!(cluster.alloc_count("ns-1", A1), 100);
    }

    #[tokio::test]
    async fn test_counters_move_with_state_intact() {
        let job = job_for("svc");
        let cluster = Arc::new(MemoryShardCluster::new());
        for i in 0..20 {
            cluster.put_counter(
                "ns-1",
                A1,
                &format!("ctr-{i}"),
                CounterState {
                    range_start: 0,
                    range_end: 1000,
                    value: i,
                },
            );
        }

        let migrator = CounterMigrator::new(Arc::clone(&cluster) as Arc<dyn ShardTransport>);
        let outcome = migrator.migrate(&job).await.unwrap();
        assert!(outcome.copied > 0);
        assert_eq!(outcome.copied + outcome.retained, 20);

        for i in 0..20 {
            let name = format!("ctr-{i}");
            let owner = job.new_ring.assign(&name).unwrap();
            let state = cluster.counter("ns-1", owner, &name).unwrap();
            assert_eq!(state.value, i);
            if owner != A1 {
                assert!(cluster.counter("ns-1", A1, &name).is_none());
            }
        }

        // Second pass finds every counter already in place.
        let second = migrator.migrate(&job).await.unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.deleted, 0);
    }
}

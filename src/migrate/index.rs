//! Index-entry migration, including the facet split.
//!
//! Index entries route by their entry key unless they carry distribution
//! facets, in which case each facet routes independently via a composite
//! key. A topology change can therefore split one stored entry across
//! several destinations while a subset of facets stays put; the source copy
//! is deleted only when no facet remains.

use crate::error::{Error, Result};
use crate::migrate::entry::IndexRefresher;
use crate::migrate::{MigrationJob, MigrationOutcome, ShardMigrator, MIGRATION_PAGE_SIZE};
use crate::remote::{ShardTransport, StoredIndexEntry};
use crate::ring::ConsistentHashRing;
use crate::types::{RequestContext, ShardRole};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Separator between entry key and facet value in the routing key. Control
/// character, cannot occur in either part.
const FACET_SEPARATOR: char = '\u{1}';

/// Composite ring key for one facet of an index entry.
pub fn facet_routing_key(entry_key: &str, facet: &str) -> String {
    format!("{entry_key}{FACET_SEPARATOR}{facet}")
}

/// Recomputes the current index entries one record produces for a role.
///
/// Seam to the indexing pipeline: migration never interprets record bodies
/// itself, it asks the computer and places whatever comes back.
#[async_trait::async_trait]
pub trait IndexComputer: Send + Sync + std::fmt::Debug {
    async fn compute(
        &self,
        ctx: &RequestContext,
        role: ShardRole,
        ancestor: &str,
    ) -> Result<Vec<StoredIndexEntry>>;
}

/// Migrator for `ShardRole::Index` and `ShardRole::FullText` entries.
#[derive(Debug)]
pub struct IndexMigrator {
    transport: Arc<dyn ShardTransport>,
    computer: Arc<dyn IndexComputer>,
    page_size: usize,
}

impl IndexMigrator {
    pub fn new(transport: Arc<dyn ShardTransport>, computer: Arc<dyn IndexComputer>) -> Self {
        Self {
            transport,
            computer,
            page_size: MIGRATION_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Re-place one recomputed entry.
    ///
    /// Routing decisions are made over the facets actually stored on the
    /// source, so a re-run after a partial failure only touches what is
    /// still misplaced; payloads are always taken from the recomputation.
    async fn migrate_entry(
        &self,
        job: &MigrationJob,
        entry: &StoredIndexEntry,
        outcome: &mut MigrationOutcome,
    ) -> Result<()> {
        let stored = match self
            .transport
            .fetch_index_entry(&job.source_ctx, &job.source, job.role, &entry.key)
            .await
        {
            Ok(stored) => stored,
            Err(e) if e.is_skippable() => {
                outcome.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if stored.facets.is_empty() {
            return self.migrate_whole_entry(job, entry, outcome).await;
        }

        let mut staying: BTreeSet<String> = BTreeSet::new();
        let mut movers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for facet in &stored.facets {
            let route = facet_routing_key(&entry.key, facet);
            let dest = job
                .new_ring
                .assign(&route)
                .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?;
            if dest == job.source {
                staying.insert(facet.clone());
            } else {
                movers
                    .entry(dest.to_string())
                    .or_default()
                    .insert(facet.clone());
            }
        }

        if movers.is_empty() {
            outcome.retained += 1;
            return Ok(());
        }

        for (dest, facets) in movers {
            self.transport
                .store_index_entry(&job.dest_ctx, &dest, job.role, &entry.with_facets(facets))
                .await?;
            outcome.copied += 1;
        }

        if job.delete_source {
            if staying.is_empty() {
                self.transport
                    .delete_index_entry(&job.source_ctx, &job.source, job.role, &entry.key)
                    .await?;
                outcome.deleted += 1;
            } else {
                self.transport
                    .replace_index_entry(
                        &job.source_ctx,
                        &job.source,
                        job.role,
                        &entry.with_facets(staying),
                    )
                    .await?;
                outcome.retained += 1;
            }
        }
        Ok(())
    }

    /// Facetless entry: routes as a unit by its entry key.
    async fn migrate_whole_entry(
        &self,
        job: &MigrationJob,
        entry: &StoredIndexEntry,
        outcome: &mut MigrationOutcome,
    ) -> Result<()> {
        let dest = job
            .new_ring
            .assign(&entry.key)
            .ok_or_else(|| Error::Internal("destination ring has no endpoints".into()))?
            .to_string();
        if dest == job.source {
            outcome.retained += 1;
            return Ok(());
        }
        self.transport
            .store_index_entry(&job.dest_ctx, &dest, job.role, &entry.with_facets([]))
            .await?;
        outcome.copied += 1;
        if job.delete_source {
            self.transport
                .delete_index_entry(&job.source_ctx, &job.source, job.role, &entry.key)
                .await?;
            outcome.deleted += 1;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ShardMigrator for IndexMigrator {
    async fn migrate(&self, job: &MigrationJob) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();
        let mut cursor: Option<String> = None;

        loop {
            // Index shards list the ancestor keys that have entries here.
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
            for ancestor in &page.keys {
                let entries = self
                    .computer
                    .compute(&job.source_ctx, job.role, ancestor)
                    .await?;
                for entry in &entries {
                    self.migrate_entry(job, entry, &mut outcome).await?;
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
            copied = outcome.copied,
            deleted = outcome.deleted,
            retained = outcome.retained,
            "index shard migrated"
        );
        Ok(outcome)
    }
}

/// Ring-routing implementation of [`IndexRefresher`].
///
/// Used after entry moves: recomputes both index roles for the moved record
/// and stores each entry (or facet subset) on its current ring owner.
#[derive(Debug)]
pub struct RingIndexRefresher {
    transport: Arc<dyn ShardTransport>,
    computer: Arc<dyn IndexComputer>,
    ctx: RequestContext,
    rings: BTreeMap<ShardRole, Arc<ConsistentHashRing>>,
}

impl RingIndexRefresher {
    pub fn new(
        transport: Arc<dyn ShardTransport>,
        computer: Arc<dyn IndexComputer>,
        ctx: RequestContext,
        index_ring: Arc<ConsistentHashRing>,
        fulltext_ring: Arc<ConsistentHashRing>,
    ) -> Self {
        let mut rings = BTreeMap::new();
        rings.insert(ShardRole::Index, index_ring);
        rings.insert(ShardRole::FullText, fulltext_ring);
        Self {
            transport,
            computer,
            ctx,
            rings,
        }
    }
}

#[async_trait::async_trait]
impl IndexRefresher for RingIndexRefresher {
    async fn refresh(&self, ancestor: &str) -> Result<()> {
        for (role, ring) in &self.rings {
            let entries = self.computer.compute(&self.ctx, *role, ancestor).await?;
            for entry in entries {
                if entry.facets.is_empty() {
                    let dest = ring
                        .assign(&entry.key)
                        .ok_or_else(|| Error::Internal("index ring has no endpoints".into()))?;
                    self.transport
                        .store_index_entry(&self.ctx, dest, *role, &entry)
                        .await?;
                    continue;
                }
                let mut by_dest: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
                for facet in &entry.facets {
                    let dest = ring
                        .assign(&facet_routing_key(&entry.key, facet))
                        .ok_or_else(|| Error::Internal("index ring has no endpoints".into()))?;
                    by_dest.entry(dest).or_default().insert(facet.clone());
                }
                for (dest, facets) in by_dest {
                    self.transport
                        .store_index_entry(&self.ctx, dest, *role, &entry.with_facets(facets))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

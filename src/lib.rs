//! Core of a horizontally sharded key/value and index store.
//!
//! Data for a tenant service is spread over independent shard pools per
//! functional role (manifest, entries, secondary index, full-text index,
//! allocation ids), with placement decided by consistent hashing. This
//! crate provides:
//! - **Consistent-hash placement** with immutable ring snapshots
//! - **Cached topology resolution** with single-flight refresh
//! - **A crash-recoverable migration orchestrator** for growing and
//!   shrinking shard pools and for promoting services onto fresh pools
//! - **Per-role migrators**, including facet-level splitting of index
//!   entries across destinations
//!
//! # Example
//!
//! ```rust,no_run
//! use shardgrid::{
//!     GridConfig, HttpShardTransport, MigrationOrchestrator, PoolChange,
//!     RemoteRequester, ShardRole,
//! };
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # #[derive(Debug)] struct Registry; // some TopologyStore implementation
//! # #[async_trait::async_trait] impl shardgrid::TopologyStore for Registry {
//! #     async fn fetch_assignment(&self, _: &str) -> shardgrid::Result<shardgrid::Versioned<shardgrid::ServiceAssignment>> { unimplemented!() }
//! #     async fn store_assignment(&self, _: &shardgrid::ServiceAssignment, _: u64) -> shardgrid::Result<u64> { unimplemented!() }
//! #     async fn fetch_status(&self, _: &str) -> shardgrid::Result<shardgrid::Versioned<shardgrid::ServiceStatus>> { unimplemented!() }
//! #     async fn cas_status(&self, _: &str, _: shardgrid::ServiceStatus, _: u64) -> shardgrid::Result<u64> { unimplemented!() }
//! #     async fn fetch_namespace(&self, _: &str) -> shardgrid::Result<shardgrid::Versioned<String>> { unimplemented!() }
//! #     async fn cas_namespace(&self, _: &str, _: &str, _: u64) -> shardgrid::Result<u64> { unimplemented!() }
//! #     async fn shard_url(&self, _: &str, _: ShardRole) -> shardgrid::Result<String> { unimplemented!() }
//! #     async fn assignable_shards(&self, _: ShardRole) -> shardgrid::Result<Vec<String>> { unimplemented!() }
//! #     async fn save_backup_record(&self, _: &str, _: &shardgrid::BackupRecord) -> shardgrid::Result<()> { unimplemented!() }
//! #     async fn load_backup_record(&self, _: &str) -> shardgrid::Result<Option<shardgrid::BackupRecord>> { unimplemented!() }
//! #     async fn delete_backup_record(&self, _: &str) -> shardgrid::Result<()> { unimplemented!() }
//! # }
//! # #[derive(Debug)] struct NoIndexes;
//! # #[async_trait::async_trait] impl shardgrid::IndexComputer for NoIndexes {
//! #     async fn compute(&self, _: &shardgrid::RequestContext, _: ShardRole, _: &str) -> shardgrid::Result<Vec<shardgrid::StoredIndexEntry>> { Ok(vec![]) }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GridConfig::new();
//!     let transport = HttpShardTransport::new(RemoteRequester::new(&config)?);
//!
//!     let orchestrator = MigrationOrchestrator::new(
//!         config,
//!         Arc::new(Registry),
//!         Arc::new(transport),
//!         Arc::new(NoIndexes),
//!     );
//!
//!     // Grow the entry pool by two shards and rebalance onto them.
//!     let mut changes = BTreeMap::new();
//!     changes.insert(ShardRole::Entry, PoolChange::Count(2));
//!     orchestrator.add_shards("tenant-a", changes).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Migration protocol
//!
//! Every placement change runs the same sequence, with progress persisted
//! as the service status via revision-checked CAS:
//!
//! ```text
//! Target ──▶ Maintenance(reassigning) ──▶ Maintenance(migrating) ──▶ Target
//!   validate     snapshot + backup           phase 1: entries, ids
//!                persist new pools           phase 2: indexes
//!                        │                           │
//!                        ▼ on failure                ▼ on failure
//!             MaintenanceFailure(reassigning)  MaintenanceFailure(migrating)
//!                  retry re-runs all            retry resumes migration
//! ```
//!
//! A promotion additionally allocates entirely fresh pools under a new
//! storage namespace and swaps the service's namespace pointer only after
//! every copy has landed.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod migrate;
pub mod remote;
pub mod ring;
pub mod testing;
pub mod topology;
pub mod types;

pub use config::GridConfig;
pub use error::{Error, Result};
pub use types::{
    MaintenanceProgress, MigrationPhase, PoolChange, RequestContext, ServiceAssignment,
    ServiceStatus, ShardRole, TargetStage, Versioned,
};

// Placement and topology.
pub use ring::{ConsistentHashRing, DEFAULT_RING_REPLICAS};
pub use topology::{MemoryTopologyStore, ShardTopologyResolver, SingleFlightCache, TopologyStore};

// Remote access.
pub use remote::{
    CounterState, HttpShardTransport, KeyPage, RemoteRequester, ShardTransport, StoredIndexEntry,
};

// Migration machinery.
pub use dispatch::{ErrorSink, TaskDispatcher, TaskHandle};
pub use migrate::{
    AllocIdMigrator, BackupRecord, CounterMigrator, EntryMigrator, IndexComputer, IndexMigrator,
    IndexRefresher, ManifestMigrator, MigrationJob, MigrationOrchestrator, MigrationOutcome,
    NoopIndexRefresher, RingIndexRefresher, ShardMigrator, SubtreeMigrator,
};

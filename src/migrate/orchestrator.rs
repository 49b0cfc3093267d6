//! The migration orchestrator.
//!
//! Drives every placement change of a tenant service through the same
//! crash-recoverable protocol: validate, snapshot, reassign topology,
//! migrate data in two phases, return to target. Progress is persisted as
//! the service status via revision-checked CAS, so a failed attempt leaves
//! behind exactly where it stopped and a retry resumes instead of starting
//! over.

use crate::config::GridConfig;
use crate::dispatch::{TaskDispatcher, TaskHandle};
use crate::error::{Error, Result};
use crate::migrate::backup::{dump_all_shards, BackupRecord};
use crate::migrate::{
    AllocIdMigrator, CounterMigrator, EntryMigrator, IndexComputer, IndexMigrator, MigrationJob,
    RingIndexRefresher, ShardMigrator, SubtreeMigrator,
};
use crate::remote::ShardTransport;
use crate::ring::ConsistentHashRing;
use crate::topology::{ShardTopologyResolver, TopologyStore};
use crate::types::{
    MaintenanceProgress, MigrationPhase, PoolChange, RequestContext, ServiceAssignment,
    ServiceStatus, ShardRole, TargetStage, Versioned,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Requested pool mutations, validated as a whole before anything runs.
#[derive(Debug)]
enum TopologyChange {
    Add(BTreeMap<ShardRole, PoolChange>),
    Remove(BTreeMap<ShardRole, Vec<String>>),
}

/// Where a running maintenance currently stands: the latest status revision
/// we wrote and the last progress the status reached. On failure this is
/// exactly what gets persisted.
#[derive(Debug)]
struct MaintenanceCursor {
    status_rev: u64,
    progress: MaintenanceProgress,
}

/// Everything a promotion run needs, resolved up front.
struct PromotionPlan<'a> {
    service: &'a str,
    stage: TargetStage,
    old_namespace: &'a Versioned<String>,
    old_assignment: &'a Versioned<ServiceAssignment>,
    new_namespace: &'a str,
    fresh: &'a ServiceAssignment,
}

/// Orchestrates shard-pool changes and namespace promotions for tenant
/// services.
#[derive(Debug)]
pub struct MigrationOrchestrator {
    config: GridConfig,
    store: Arc<dyn TopologyStore>,
    resolver: Arc<ShardTopologyResolver>,
    transport: Arc<dyn ShardTransport>,
    dispatcher: TaskDispatcher,
    computer: Arc<dyn IndexComputer>,
}

impl MigrationOrchestrator {
    pub fn new(
        config: GridConfig,
        store: Arc<dyn TopologyStore>,
        transport: Arc<dyn ShardTransport>,
        computer: Arc<dyn IndexComputer>,
    ) -> Self {
        let resolver = Arc::new(ShardTopologyResolver::new(Arc::clone(&store), &config));
        let dispatcher = TaskDispatcher::new(config.dispatch_poll_interval);
        Self {
            config,
            store,
            resolver,
            transport,
            dispatcher,
            computer,
        }
    }

    /// The resolver this orchestrator keeps coherent across changes.
    pub fn resolver(&self) -> Arc<ShardTopologyResolver> {
        Arc::clone(&self.resolver)
    }

    /// Grow one or more role pools and rebalance data onto the new shards.
    pub async fn add_shards(
        &self,
        service: &str,
        changes: BTreeMap<ShardRole, PoolChange>,
    ) -> Result<()> {
        self.change_topology(service, TopologyChange::Add(changes))
            .await
    }

    /// Shrink one or more role pools, draining the removed shards first.
    pub async fn remove_shards(
        &self,
        service: &str,
        changes: BTreeMap<ShardRole, Vec<String>>,
    ) -> Result<()> {
        self.change_topology(service, TopologyChange::Remove(changes))
            .await
    }

    async fn change_topology(&self, service: &str, change: TopologyChange) -> Result<()> {
        let status = self.store.fetch_status(service).await?;
        if !status.value.accepts_maintenance() {
            return Err(Error::InvalidRequest(format!(
                "service {service} is {}, not accepting maintenance",
                status.value
            )));
        }
        if let ServiceStatus::MaintenanceFailure(progress) = status.value {
            // Resume when the topology was already reassigned: either the
            // status says so, or the failure landed between the assignment
            // write and the status write, leaving the persisted assignment
            // ahead of the recorded progress.
            if progress == MaintenanceProgress::MigratingData
                || self.reassignment_landed(service).await?
            {
                return self.resume_migration(service, status).await;
            }
        }

        let stage = self.current_stage(service, &status.value).await?;
        let namespace = self.store.fetch_namespace(service).await?.value;
        let current = self.store.fetch_assignment(service).await?;
        // Full validation happens before any mutation: a rejected change
        // leaves status and assignment untouched.
        let target = self.compute_new_assignment(&current.value, &change).await?;

        let status_rev = self
            .store
            .cas_status(
                service,
                ServiceStatus::Maintenance(MaintenanceProgress::ReassigningTopology),
                status.revision,
            )
            .await?;
        let mut cursor = MaintenanceCursor {
            status_rev,
            progress: MaintenanceProgress::ReassigningTopology,
        };

        match self
            .run_topology_change(service, stage, &namespace, &current, &target, &mut cursor)
            .await
        {
            Ok(()) => {
                tracing::info!(audit = true, service, %stage, "topology change complete");
                Ok(())
            }
            Err(e) => {
                self.mark_failed(service, &cursor, &e).await;
                Err(e)
            }
        }
    }

    async fn run_topology_change(
        &self,
        service: &str,
        stage: TargetStage,
        namespace: &str,
        current: &Versioned<ServiceAssignment>,
        target: &ServiceAssignment,
        cursor: &mut MaintenanceCursor,
    ) -> Result<()> {
        let record = BackupRecord::capture(stage, namespace, &current.value);
        self.store.save_backup_record(service, &record).await?;
        dump_all_shards(
            &self.transport,
            &self.resolver,
            &record,
            &self.config.backup_root,
        )
        .await?;

        self.store
            .store_assignment(target, current.revision)
            .await?;
        self.refresh_resolver(service, target);
        cursor.status_rev = self
            .store
            .cas_status(
                service,
                ServiceStatus::Maintenance(MaintenanceProgress::MigratingData),
                cursor.status_rev,
            )
            .await?;
        cursor.progress = MaintenanceProgress::MigratingData;

        self.migrate_all(service, namespace, &current.value, target)
            .await?;

        self.store.delete_backup_record(service).await?;
        cursor.status_rev = self
            .store
            .cas_status(service, ServiceStatus::Target(stage), cursor.status_rev)
            .await?;
        Ok(())
    }

    /// Pick up a migration whose topology reassignment already landed.
    ///
    /// The backup record holds the pre-change assignment; the registry holds
    /// the post-change one. Every migrator is idempotent, so re-running the
    /// whole data phase is safe.
    async fn resume_migration(
        &self,
        service: &str,
        status: Versioned<ServiceStatus>,
    ) -> Result<()> {
        let record = self.store.load_backup_record(service).await?.ok_or_else(|| {
            Error::Internal(format!(
                "service {service} failed mid-migration but has no backup record"
            ))
        })?;
        let current = self.store.fetch_assignment(service).await?;
        tracing::info!(
            audit = true,
            service,
            attempt = %record.attempt_id,
            "resuming data migration"
        );

        let status_rev = self
            .store
            .cas_status(
                service,
                ServiceStatus::Maintenance(MaintenanceProgress::MigratingData),
                status.revision,
            )
            .await?;
        let mut cursor = MaintenanceCursor {
            status_rev,
            progress: MaintenanceProgress::MigratingData,
        };

        match self
            .finish_migration(service, &record, &current.value, &mut cursor)
            .await
        {
            Ok(()) => {
                tracing::info!(audit = true, service, "resumed migration complete");
                Ok(())
            }
            Err(e) => {
                self.mark_failed(service, &cursor, &e).await;
                Err(e)
            }
        }
    }

    async fn finish_migration(
        &self,
        service: &str,
        record: &BackupRecord,
        current: &ServiceAssignment,
        cursor: &mut MaintenanceCursor,
    ) -> Result<()> {
        self.migrate_all(service, &record.namespace, &record.assignment, current)
            .await?;
        self.store.delete_backup_record(service).await?;
        cursor.status_rev = self
            .store
            .cas_status(
                service,
                ServiceStatus::Target(record.stage),
                cursor.status_rev,
            )
            .await?;
        Ok(())
    }

    /// Promote a service onto fresh pools under a brand-new namespace.
    ///
    /// The namespace pointer is swapped as the very last step, so a failure
    /// anywhere leaves readers on the old namespace with the old (restored)
    /// assignment. A retry re-runs the promotion from scratch.
    pub async fn promote_service(&self, service: &str, stage: TargetStage) -> Result<()> {
        let status = self.store.fetch_status(service).await?;
        if !status.value.accepts_maintenance() {
            return Err(Error::InvalidRequest(format!(
                "service {service} is {}, not accepting promotion",
                status.value
            )));
        }

        let namespace = self.store.fetch_namespace(service).await?;
        let current = self.store.fetch_assignment(service).await?;
        // Validated before any mutation.
        let fresh = self.allocate_fresh_pools(service, &current.value).await?;
        let new_namespace = format!("{service}-{}", Utc::now().format("%Y%m%d%H%M%S"));

        let status_rev = self
            .store
            .cas_status(
                service,
                ServiceStatus::Maintenance(MaintenanceProgress::ReassigningTopology),
                status.revision,
            )
            .await?;
        let mut cursor = MaintenanceCursor {
            status_rev,
            progress: MaintenanceProgress::ReassigningTopology,
        };
        let mut swapped_assignment: Option<u64> = None;

        let plan = PromotionPlan {
            service,
            stage,
            old_namespace: &namespace,
            old_assignment: &current,
            new_namespace: &new_namespace,
            fresh: &fresh,
        };
        match self
            .run_promotion(&plan, &mut cursor, &mut swapped_assignment)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    audit = true,
                    service,
                    %stage,
                    namespace = %new_namespace,
                    "promotion complete"
                );
                Ok(())
            }
            Err(e) => {
                // The pointer never swapped, so readers stayed on the old
                // namespace; put the old pools back under them.
                if let Some(rev) = swapped_assignment {
                    match self.store.store_assignment(&current.value, rev).await {
                        Ok(_) => self.refresh_resolver(service, &current.value),
                        Err(restore_err) => tracing::error!(
                            service,
                            error = %restore_err,
                            "failed to restore pre-promotion assignment"
                        ),
                    }
                }
                self.mark_failed(service, &cursor, &e).await;
                Err(e)
            }
        }
    }

    async fn run_promotion(
        &self,
        plan: &PromotionPlan<'_>,
        cursor: &mut MaintenanceCursor,
        swapped_assignment: &mut Option<u64>,
    ) -> Result<()> {
        let record = BackupRecord::capture(
            plan.stage,
            plan.old_namespace.value.clone(),
            &plan.old_assignment.value,
        );
        self.store.save_backup_record(plan.service, &record).await?;
        dump_all_shards(
            &self.transport,
            &self.resolver,
            &record,
            &self.config.backup_root,
        )
        .await?;

        let rev = self
            .store
            .store_assignment(plan.fresh, plan.old_assignment.revision)
            .await?;
        *swapped_assignment = Some(rev);
        self.refresh_resolver(plan.service, plan.fresh);
        cursor.status_rev = self
            .store
            .cas_status(
                plan.service,
                ServiceStatus::Maintenance(MaintenanceProgress::MigratingData),
                cursor.status_rev,
            )
            .await?;
        cursor.progress = MaintenanceProgress::MigratingData;

        self.copy_system_subtrees(plan).await?;

        // Cutover: only now do readers see the new namespace.
        self.store
            .cas_namespace(
                plan.service,
                plan.new_namespace,
                plan.old_namespace.revision,
            )
            .await?;
        self.store.delete_backup_record(plan.service).await?;
        cursor.status_rev = self
            .store
            .cas_status(
                plan.service,
                ServiceStatus::Target(plan.stage),
                cursor.status_rev,
            )
            .await?;
        Ok(())
    }

    /// Copy the system-prefixed subtree of every role into the new
    /// namespace, then carry over allocation state.
    ///
    /// Unlike a topology change, a promotion must land complete: any failed
    /// unit fails the promotion.
    async fn copy_system_subtrees(&self, plan: &PromotionPlan<'_>) -> Result<()> {
        let src_ctx = RequestContext::new(plan.service, &plan.old_namespace.value);
        let dst_ctx = RequestContext::new(plan.service, plan.new_namespace);

        let groups: [&[ShardRole]; 2] = [
            &[ShardRole::Manifest, ShardRole::Entry, ShardRole::AllocIds],
            &[ShardRole::Index, ShardRole::FullText],
        ];
        for group in groups {
            let mut handles: Vec<TaskHandle> = Vec::new();
            for &role in group {
                let old_endpoints = self
                    .resolver
                    .endpoints(plan.old_assignment.value.pool(role), role)
                    .await?;
                let new_endpoints = self
                    .resolver
                    .endpoints(plan.fresh.pool(role), role)
                    .await?;
                let old_ring = Arc::new(ConsistentHashRing::build(
                    &old_endpoints,
                    self.config.ring_replicas,
                ));
                let new_ring = Arc::new(ConsistentHashRing::build(
                    &new_endpoints,
                    self.config.ring_replicas,
                ));

                for source in &old_endpoints {
                    let job = MigrationJob::namespace_copy(
                        role,
                        source.clone(),
                        Arc::clone(&old_ring),
                        Arc::clone(&new_ring),
                        src_ctx.clone(),
                        dst_ctx.clone(),
                        self.config.system_prefix.clone(),
                    );
                    let migrators: Vec<Arc<dyn ShardMigrator>> = if role == ShardRole::AllocIds {
                        vec![
                            Arc::new(AllocIdMigrator::new(Arc::clone(&self.transport))),
                            Arc::new(CounterMigrator::new(Arc::clone(&self.transport))),
                        ]
                    } else {
                        vec![Arc::new(SubtreeMigrator::new(Arc::clone(&self.transport)))]
                    };
                    for migrator in migrators {
                        let job = job.clone();
                        handles.push(self.dispatcher.submit(
                            format!("promote:{role}:{source}"),
                            async move { migrator.migrate(&job).await.map(|_| ()) },
                        ));
                    }
                }
            }
            let failures = self.dispatcher.wait_all_collect(&handles).await;
            if let Some((label, error)) = failures.into_iter().next() {
                return Err(Error::Internal(format!(
                    "promotion unit {label} failed: {error}"
                )));
            }
        }
        Ok(())
    }

    /// Run both migration phases for a topology change. Phase two only
    /// starts after every phase-one unit has finished.
    async fn migrate_all(
        &self,
        service: &str,
        namespace: &str,
        old: &ServiceAssignment,
        new: &ServiceAssignment,
    ) -> Result<()> {
        let ctx = RequestContext::new(service, namespace);
        self.run_phase(MigrationPhase::DataFirst, &ctx, old, new)
            .await?;
        self.run_phase(MigrationPhase::IndexSecond, &ctx, old, new)
            .await
    }

    async fn run_phase(
        &self,
        phase: MigrationPhase,
        ctx: &RequestContext,
        old: &ServiceAssignment,
        new: &ServiceAssignment,
    ) -> Result<()> {
        let mut handles: Vec<TaskHandle> = Vec::new();
        for role in ShardRole::ALL {
            if role.phase() != Some(phase) {
                continue;
            }
            let old_endpoints = self.resolver.endpoints(old.pool(role), role).await?;
            let new_endpoints = self.resolver.endpoints(new.pool(role), role).await?;
            if old_endpoints == new_endpoints {
                continue;
            }
            let old_ring = Arc::new(ConsistentHashRing::build(
                &old_endpoints,
                self.config.ring_replicas,
            ));
            let new_ring = Arc::new(ConsistentHashRing::build(
                &new_endpoints,
                self.config.ring_replicas,
            ));
            let migrators = self.migrators_for(role, ctx, new).await?;

            for source in &old_endpoints {
                let job = MigrationJob::topology_change(
                    role,
                    source.clone(),
                    Arc::clone(&old_ring),
                    Arc::clone(&new_ring),
                    ctx.clone(),
                );
                for migrator in &migrators {
                    let migrator = Arc::clone(migrator);
                    let job = job.clone();
                    handles.push(self.dispatcher.submit(
                        format!("{role}:{source}"),
                        async move { migrator.migrate(&job).await.map(|_| ()) },
                    ));
                }
            }
        }

        // Unit failures were logged when they happened; the batch itself
        // only waits. A later re-run retries whatever stayed misplaced.
        let failures = self.dispatcher.wait_all_collect(&handles).await;
        if !failures.is_empty() {
            tracing::warn!(
                ?phase,
                failed_units = failures.len(),
                "migration units failed"
            );
        }
        Ok(())
    }

    async fn migrators_for(
        &self,
        role: ShardRole,
        ctx: &RequestContext,
        new: &ServiceAssignment,
    ) -> Result<Vec<Arc<dyn ShardMigrator>>> {
        match role {
            ShardRole::Entry => {
                let manifest = new.pool(ShardRole::Manifest).first().ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "service {} has no manifest shard",
                        ctx.service
                    ))
                })?;
                let manifest_endpoint =
                    self.resolver.shard_url(manifest, ShardRole::Manifest).await?;
                let refresher = Arc::new(RingIndexRefresher::new(
                    Arc::clone(&self.transport),
                    Arc::clone(&self.computer),
                    ctx.clone(),
                    self.ring_for(new, ShardRole::Index).await?,
                    self.ring_for(new, ShardRole::FullText).await?,
                ));
                Ok(vec![Arc::new(EntryMigrator::new(
                    Arc::clone(&self.transport),
                    self.dispatcher.clone(),
                    refresher,
                    manifest_endpoint,
                )) as Arc<dyn ShardMigrator>])
            }
            ShardRole::AllocIds => Ok(vec![
                Arc::new(AllocIdMigrator::new(Arc::clone(&self.transport)))
                    as Arc<dyn ShardMigrator>,
                Arc::new(CounterMigrator::new(Arc::clone(&self.transport))),
            ]),
            ShardRole::Index | ShardRole::FullText => Ok(vec![Arc::new(IndexMigrator::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.computer),
            )) as Arc<dyn ShardMigrator>]),
            // Manifest only moves on promotion.
            ShardRole::Manifest => Ok(Vec::new()),
        }
    }

    async fn ring_for(
        &self,
        assignment: &ServiceAssignment,
        role: ShardRole,
    ) -> Result<Arc<ConsistentHashRing>> {
        let endpoints = self.resolver.endpoints(assignment.pool(role), role).await?;
        Ok(Arc::new(ConsistentHashRing::build(
            &endpoints,
            self.config.ring_replicas,
        )))
    }

    async fn compute_new_assignment(
        &self,
        current: &ServiceAssignment,
        change: &TopologyChange,
    ) -> Result<ServiceAssignment> {
        let mut target = current.clone();
        match change {
            TopologyChange::Add(changes) => {
                for (role, change) in changes {
                    if role.fixed_pool() {
                        return Err(Error::InvalidRequest(format!(
                            "{role} pool is fixed and cannot grow"
                        )));
                    }
                    let registered = self.store.assignable_shards(*role).await?;
                    let assigned: BTreeSet<&String> = current.pool(*role).iter().collect();
                    let names = match change {
                        PoolChange::Names(names) => {
                            for name in names {
                                if !registered.contains(name) {
                                    return Err(Error::InvalidRequest(format!(
                                        "{role} shard {name} is not registered"
                                    )));
                                }
                                if assigned.contains(name) {
                                    return Err(Error::InvalidRequest(format!(
                                        "{role} shard {name} is already assigned"
                                    )));
                                }
                            }
                            names.clone()
                        }
                        PoolChange::Count(count) => {
                            let mut available: Vec<String> = registered
                                .into_iter()
                                .filter(|n| !assigned.contains(n))
                                .collect();
                            if available.len() < *count {
                                return Err(Error::InvalidRequest(format!(
                                    "{role} has {} assignable shards, {count} requested",
                                    available.len()
                                )));
                            }
                            available.truncate(*count);
                            available
                        }
                    };
                    target.pools.entry(*role).or_default().extend(names);
                }
            }
            TopologyChange::Remove(changes) => {
                for (role, names) in changes {
                    if role.fixed_pool() {
                        return Err(Error::InvalidRequest(format!(
                            "{role} pool is fixed and cannot shrink"
                        )));
                    }
                    let pool = target.pools.entry(*role).or_default();
                    for name in names {
                        let Some(pos) = pool.iter().position(|n| n == name) else {
                            return Err(Error::InvalidRequest(format!(
                                "{role} shard {name} is not assigned"
                            )));
                        };
                        pool.remove(pos);
                    }
                    if pool.len() < role.min_pool_size() {
                        return Err(Error::InvalidRequest(format!(
                            "removal would leave the {role} pool empty"
                        )));
                    }
                }
            }
        }
        target.validate()?;
        Ok(target)
    }

    /// Allocate completely fresh pools for a promotion, sized per config,
    /// disjoint from the pools currently serving the service.
    async fn allocate_fresh_pools(
        &self,
        service: &str,
        current: &ServiceAssignment,
    ) -> Result<ServiceAssignment> {
        let mut pools = BTreeMap::new();
        for role in ShardRole::ALL {
            let want = self.config.promotion_pool_size(role);
            let registered = self.store.assignable_shards(role).await?;
            let in_use: BTreeSet<&String> = current.pool(role).iter().collect();
            let mut fresh: Vec<String> = registered
                .into_iter()
                .filter(|n| !in_use.contains(n))
                .collect();
            if fresh.len() < want {
                return Err(Error::InvalidRequest(format!(
                    "{role} needs {want} fresh shards for promotion, {} available",
                    fresh.len()
                )));
            }
            fresh.truncate(want);
            pools.insert(role, fresh);
        }
        let assignment = ServiceAssignment::new(service, pools);
        assignment.validate()?;
        Ok(assignment)
    }

    /// Whether a failed attempt already persisted its new assignment. The
    /// backup record holds the pre-change one; any difference means the
    /// reassignment landed and only data migration is owed.
    async fn reassignment_landed(&self, service: &str) -> Result<bool> {
        let Some(record) = self.store.load_backup_record(service).await? else {
            return Ok(false);
        };
        let current = self.store.fetch_assignment(service).await?;
        Ok(current.value != record.assignment)
    }

    /// The stage the service returns to when this maintenance succeeds.
    async fn current_stage(&self, service: &str, status: &ServiceStatus) -> Result<TargetStage> {
        match status {
            ServiceStatus::Target(stage) => Ok(*stage),
            _ => {
                // Retrying a failed attempt: the stage was captured into the
                // backup record before anything mutated.
                let record = self.store.load_backup_record(service).await?;
                record.map(|r| r.stage).ok_or_else(|| {
                    Error::Internal(format!(
                        "service {service} has a maintenance failure but no backup record; \
                         the status needs a manual reset"
                    ))
                })
            }
        }
    }

    fn refresh_resolver(&self, service: &str, assignment: &ServiceAssignment) {
        for role in ShardRole::ALL {
            self.resolver
                .invalidate(service, role, assignment.pool(role).to_vec());
        }
    }

    async fn mark_failed(&self, service: &str, cursor: &MaintenanceCursor, cause: &Error) {
        tracing::error!(
            audit = true,
            service,
            error = %cause,
            progress = %cursor.progress,
            "maintenance failed"
        );
        if let Err(e) = self
            .store
            .cas_status(
                service,
                ServiceStatus::MaintenanceFailure(cursor.progress),
                cursor.status_rev,
            )
            .await
        {
            tracing::error!(service, error = %e, "failed to persist maintenance failure");
        }
    }
}

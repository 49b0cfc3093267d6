//! Test fabric: in-memory shard cluster, scripted index computer, and a
//! fault-injecting registry wrapper.
//!
//! Everything here is real production-trait implementations over process
//! memory, so migrator and orchestrator tests exercise the exact code paths
//! the HTTP transport does.

use crate::error::{Error, Result};
use crate::migrate::{BackupRecord, IndexComputer};
use crate::remote::{CounterState, KeyPage, ShardTransport, StoredIndexEntry};
use crate::topology::{MemoryTopologyStore, TopologyStore};
use crate::types::{RequestContext, ServiceAssignment, ServiceStatus, ShardRole, Versioned};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type ShardKey = (String, String, ShardRole);

#[derive(Debug, Default)]
struct ClusterState {
    records: HashMap<ShardKey, BTreeMap<String, Vec<u8>>>,
    indexes: HashMap<ShardKey, BTreeMap<String, StoredIndexEntry>>,
    alloc_counts: HashMap<(String, String), u64>,
    counters: HashMap<(String, String), BTreeMap<String, CounterState>>,
    backup_requests: Vec<String>,
}

/// In-memory implementation of [`ShardTransport`]: a whole shard fleet in
/// one process, keyed by (namespace, endpoint, role).
#[derive(Debug, Default)]
pub struct MemoryShardCluster {
    state: Mutex<ClusterState>,
    ops: Mutex<BTreeMap<&'static str, u64>>,
    fail_backups: AtomicBool,
}

impl MemoryShardCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, op: &'static str) {
        *self.ops.lock().entry(op).or_insert(0) += 1;
    }

    /// How often a transport operation has run, by name.
    pub fn op_count(&self, op: &str) -> u64 {
        self.ops.lock().get(op).copied().unwrap_or(0)
    }

    /// Make every backup request fail until cleared.
    pub fn set_fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::Release);
    }

    /// Destination URIs of all backup requests seen so far.
    pub fn backup_requests(&self) -> Vec<String> {
        self.state.lock().backup_requests.clone()
    }

    pub fn put_record(&self, ns: &str, endpoint: &str, role: ShardRole, key: &str, body: &[u8]) {
        self.state
            .lock()
            .records
            .entry((ns.to_string(), endpoint.to_string(), role))
            .or_default()
            .insert(key.to_string(), body.to_vec());
    }

    pub fn record(&self, ns: &str, endpoint: &str, role: ShardRole, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .records
            .get(&(ns.to_string(), endpoint.to_string(), role))
            .and_then(|m| m.get(key).cloned())
    }

    pub fn put_index_entry(&self, ns: &str, endpoint: &str, role: ShardRole, entry: StoredIndexEntry) {
        self.state
            .lock()
            .indexes
            .entry((ns.to_string(), endpoint.to_string(), role))
            .or_default()
            .insert(entry.key.clone(), entry);
    }

    pub fn index_entry(
        &self,
        ns: &str,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Option<StoredIndexEntry> {
        self.state
            .lock()
            .indexes
            .get(&(ns.to_string(), endpoint.to_string(), role))
            .and_then(|m| m.get(key).cloned())
    }

    pub fn set_alloc_count(&self, ns: &str, endpoint: &str, count: u64) {
        self.state
            .lock()
            .alloc_counts
            .insert((ns.to_string(), endpoint.to_string()), count);
    }

    pub fn alloc_count(&self, ns: &str, endpoint: &str) -> u64 {
        self.state
            .lock()
            .alloc_counts
            .get(&(ns.to_string(), endpoint.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn put_counter(&self, ns: &str, endpoint: &str, name: &str, state: CounterState) {
        self.state
            .lock()
            .counters
            .entry((ns.to_string(), endpoint.to_string()))
            .or_default()
            .insert(name.to_string(), state);
    }

    pub fn counter(&self, ns: &str, endpoint: &str, name: &str) -> Option<CounterState> {
        self.state
            .lock()
            .counters
            .get(&(ns.to_string(), endpoint.to_string()))
            .and_then(|m| m.get(name).copied())
    }

    fn shard_key(ctx: &RequestContext, endpoint: &str, role: ShardRole) -> ShardKey {
        (ctx.namespace.clone(), endpoint.to_string(), role)
    }
}

#[async_trait::async_trait]
impl ShardTransport for MemoryShardCluster {
    async fn list_keys(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KeyPage> {
        let state = self.state.lock();
        let shard = Self::shard_key(ctx, endpoint, role);
        // Records list directly; index shards additionally list the
        // ancestors of their stored entries.
        let mut keys: BTreeSet<String> = state
            .records
            .get(&shard)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(entries) = state.indexes.get(&shard) {
            keys.extend(entries.values().map(|e| e.ancestor.clone()));
        }

        let page: Vec<String> = keys
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| cursor.map_or(true, |c| k.as_str() > c))
            .take(limit + 1)
            .collect();
        if page.len() > limit {
            let keys: Vec<String> = page[..limit].to_vec();
            let cursor = keys.last().cloned();
            Ok(KeyPage::new(keys, cursor))
        } else {
            Ok(KeyPage::new(page, None))
        }
    }

    async fn fetch_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<Bytes> {
        self.state
            .lock()
            .records
            .get(&Self::shard_key(ctx, endpoint, role))
            .and_then(|m| m.get(key))
            .map(|v| Bytes::from(v.clone()))
            .ok_or_else(|| Error::NotFound(format!("{role} record {key} on {endpoint}")))
    }

    async fn store_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
        body: Bytes,
    ) -> Result<()> {
        self.bump("store_record");
        self.state
            .lock()
            .records
            .entry(Self::shard_key(ctx, endpoint, role))
            .or_default()
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }

    async fn delete_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()> {
        self.bump("delete_record");
        if let Some(m) = self
            .state
            .lock()
            .records
            .get_mut(&Self::shard_key(ctx, endpoint, role))
        {
            m.remove(key);
        }
        Ok(())
    }

    async fn fetch_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<StoredIndexEntry> {
        self.state
            .lock()
            .indexes
            .get(&Self::shard_key(ctx, endpoint, role))
            .and_then(|m| m.get(key).cloned())
            .ok_or_else(|| Error::NotFound(format!("{role} index entry {key} on {endpoint}")))
    }

    async fn store_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()> {
        self.bump("store_index");
        let mut state = self.state.lock();
        let shard = state
            .indexes
            .entry(Self::shard_key(ctx, endpoint, role))
            .or_default();
        match shard.get_mut(&entry.key) {
            Some(existing) => {
                // Merge semantics: facet union, freshest payload wins.
                existing.facets.extend(entry.facets.iter().cloned());
                existing.payload = entry.payload.clone();
                existing.ancestor = entry.ancestor.clone();
            }
            None => {
                shard.insert(entry.key.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn replace_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()> {
        self.bump("replace_index");
        self.state
            .lock()
            .indexes
            .entry(Self::shard_key(ctx, endpoint, role))
            .or_default()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()> {
        self.bump("delete_index");
        if let Some(m) = self
            .state
            .lock()
            .indexes
            .get_mut(&Self::shard_key(ctx, endpoint, role))
        {
            m.remove(key);
        }
        Ok(())
    }

    async fn poll_alloc_count(&self, ctx: &RequestContext, endpoint: &str) -> Result<u64> {
        self.bump("poll_alloc");
        let mut state = self.state.lock();
        let count = state
            .alloc_counts
            .insert((ctx.namespace.clone(), endpoint.to_string()), 0)
            .unwrap_or(0);
        Ok(count)
    }

    async fn grant_ids(&self, ctx: &RequestContext, endpoint: &str, count: u64) -> Result<()> {
        self.bump("grant_ids");
        *self
            .state
            .lock()
            .alloc_counts
            .entry((ctx.namespace.clone(), endpoint.to_string()))
            .or_insert(0) += count;
        Ok(())
    }

    async fn list_counters(&self, ctx: &RequestContext, endpoint: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .counters
            .get(&(ctx.namespace.clone(), endpoint.to_string()))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
    ) -> Result<CounterState> {
        self.state
            .lock()
            .counters
            .get(&(ctx.namespace.clone(), endpoint.to_string()))
            .and_then(|m| m.get(name).copied())
            .ok_or_else(|| Error::NotFound(format!("counter {name} on {endpoint}")))
    }

    async fn store_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
        state: CounterState,
    ) -> Result<()> {
        self.bump("store_counter");
        self.state
            .lock()
            .counters
            .entry((ctx.namespace.clone(), endpoint.to_string()))
            .or_default()
            .insert(name.to_string(), state);
        Ok(())
    }

    async fn delete_counter(&self, ctx: &RequestContext, endpoint: &str, name: &str) -> Result<()> {
        self.bump("delete_counter");
        if let Some(m) = self
            .state
            .lock()
            .counters
            .get_mut(&(ctx.namespace.clone(), endpoint.to_string()))
        {
            m.remove(name);
        }
        Ok(())
    }

    async fn backup_shard(
        &self,
        _ctx: &RequestContext,
        endpoint: &str,
        _role: ShardRole,
        dest_uri: &str,
    ) -> Result<()> {
        self.bump("backup");
        if self.fail_backups.load(Ordering::Acquire) {
            return Err(Error::RemoteUnavailable {
                url: endpoint.to_string(),
                status: 503,
            });
        }
        self.state
            .lock()
            .backup_requests
            .push(dest_uri.to_string());
        Ok(())
    }
}

/// Index computer returning pre-scripted entries per (role, ancestor).
#[derive(Debug, Default)]
pub struct FixedIndexComputer {
    entries: Mutex<HashMap<(ShardRole, String), Vec<StoredIndexEntry>>>,
}

impl FixedIndexComputer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, role: ShardRole, ancestor: &str, entries: Vec<StoredIndexEntry>) {
        self.entries
            .lock()
            .insert((role, ancestor.to_string()), entries);
    }
}

#[async_trait::async_trait]
impl IndexComputer for FixedIndexComputer {
    async fn compute(
        &self,
        _ctx: &RequestContext,
        role: ShardRole,
        ancestor: &str,
    ) -> Result<Vec<StoredIndexEntry>> {
        Ok(self
            .entries
            .lock()
            .get(&(role, ancestor.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Registry wrapper that fails `shard_url` a scripted number of times per
/// shard, for exercising the orchestrator's failure and resume paths.
#[derive(Debug)]
pub struct FailingStore {
    inner: Arc<MemoryTopologyStore>,
    failing_urls: Mutex<HashMap<String, u32>>,
    failing_cas: Mutex<Option<(ServiceStatus, u32)>>,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryTopologyStore>) -> Self {
        Self {
            inner,
            failing_urls: Mutex::new(HashMap::new()),
            failing_cas: Mutex::new(None),
        }
    }

    /// Fail the next `times` endpoint lookups for this shard.
    pub fn fail_shard_url(&self, shard: &str, times: u32) {
        self.failing_urls.lock().insert(shard.to_string(), times);
    }

    /// Fail the next `times` status writes that target exactly `status`.
    pub fn fail_cas_status_to(&self, status: ServiceStatus, times: u32) {
        *self.failing_cas.lock() = Some((status, times));
    }
}

#[async_trait::async_trait]
impl TopologyStore for FailingStore {
    async fn fetch_assignment(&self, service: &str) -> Result<Versioned<ServiceAssignment>> {
        self.inner.fetch_assignment(service).await
    }

    async fn store_assignment(
        &self,
        assignment: &ServiceAssignment,
        expected_revision: u64,
    ) -> Result<u64> {
        self.inner.store_assignment(assignment, expected_revision).await
    }

    async fn fetch_status(&self, service: &str) -> Result<Versioned<ServiceStatus>> {
        self.inner.fetch_status(service).await
    }

    async fn cas_status(
        &self,
        service: &str,
        status: ServiceStatus,
        expected_revision: u64,
    ) -> Result<u64> {
        {
            let mut failing = self.failing_cas.lock();
            if let Some((target, remaining)) = failing.as_mut() {
                if *target == status && *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::RemoteUnavailable {
                        url: format!("status:{service}"),
                        status: 503,
                    });
                }
            }
        }
        self.inner.cas_status(service, status, expected_revision).await
    }

    async fn fetch_namespace(&self, service: &str) -> Result<Versioned<String>> {
        self.inner.fetch_namespace(service).await
    }

    async fn cas_namespace(
        &self,
        service: &str,
        namespace: &str,
        expected_revision: u64,
    ) -> Result<u64> {
        self.inner.cas_namespace(service, namespace, expected_revision).await
    }

    async fn shard_url(&self, shard: &str, role: ShardRole) -> Result<String> {
        {
            let mut failing = self.failing_urls.lock();
            if let Some(remaining) = failing.get_mut(shard) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::RemoteUnavailable {
                        url: shard.to_string(),
                        status: 503,
                    });
                }
            }
        }
        self.inner.shard_url(shard, role).await
    }

    async fn assignable_shards(&self, role: ShardRole) -> Result<Vec<String>> {
        self.inner.assignable_shards(role).await
    }

    async fn save_backup_record(&self, service: &str, record: &BackupRecord) -> Result<()> {
        self.inner.save_backup_record(service, record).await
    }

    async fn load_backup_record(&self, service: &str) -> Result<Option<BackupRecord>> {
        self.inner.load_backup_record(service).await
    }

    async fn delete_backup_record(&self, service: &str) -> Result<()> {
        self.inner.delete_backup_record(service).await
    }
}

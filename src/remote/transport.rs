//! Typed shard operations.
//!
//! `ShardTransport` is the seam between the migration machinery and the
//! external per-shard store: migrators and the orchestrator only ever talk
//! through it, so tests can swap the HTTP implementation for an in-memory
//! fabric.

use crate::error::Result;
use crate::types::{RequestContext, ShardRole};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One page of a cursor-based key listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPage {
    /// Keys in this page, in listing order. For index roles these are the
    /// logical ancestor keys that have entries on the shard.
    pub keys: Vec<String>,
    /// Opaque cursor for the next page, absent on the last page.
    pub cursor: Option<String>,
}

impl KeyPage {
    pub fn new(keys: Vec<String>, cursor: Option<String>) -> Self {
        Self { keys, cursor }
    }

    pub fn is_last(&self) -> bool {
        self.cursor.is_none()
    }
}

/// An index entry as stored on one shard.
///
/// The facet set is the subset of the entry's DISTKEY values assigned to the
/// holding shard; the same logical entry may exist on several shards with
/// disjoint facet subsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIndexEntry {
    /// Logical record the entry derives from.
    pub ancestor: String,
    /// Index entry key.
    pub key: String,
    /// DISTKEY facet values held on this shard. Empty for a facetless entry.
    pub facets: BTreeSet<String>,
    /// Posting payload.
    pub payload: Vec<u8>,
}

impl StoredIndexEntry {
    pub fn new(
        ancestor: impl Into<String>,
        key: impl Into<String>,
        facets: impl IntoIterator<Item = String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            ancestor: ancestor.into(),
            key: key.into(),
            facets: facets.into_iter().collect(),
            payload,
        }
    }

    /// Copy of this entry restricted to a facet subset.
    pub fn with_facets(&self, facets: impl IntoIterator<Item = String>) -> Self {
        Self {
            ancestor: self.ancestor.clone(),
            key: self.key.clone(),
            facets: facets.into_iter().collect(),
            payload: self.payload.clone(),
        }
    }
}

/// Counter state: the configured range plus the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub range_start: u64,
    pub range_end: u64,
    pub value: u64,
}

/// Remote operations against one shard endpoint.
///
/// Raw record get/put/delete/list is available on every role shard; index
/// and allocation operations are typed views the relevant roles expose on
/// top of it.
#[async_trait::async_trait]
pub trait ShardTransport: Send + Sync + std::fmt::Debug {
    /// List keys with the given prefix, one page per call.
    async fn list_keys(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KeyPage>;

    /// Fetch a raw record. `NotFound` if the key is absent.
    async fn fetch_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<Bytes>;

    /// Store a raw record.
    async fn store_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
        body: Bytes,
    ) -> Result<()>;

    /// Delete a raw record. Deleting an absent key is not an error.
    async fn delete_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()>;

    /// Fetch a stored index entry by entry key. `NotFound` if absent.
    async fn fetch_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<StoredIndexEntry>;

    /// Store an index entry, merging its facet set into any existing entry
    /// with the same key on the endpoint.
    async fn store_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()>;

    /// Store an index entry, replacing any existing entry with the same key.
    async fn replace_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()>;

    /// Remove an index entry entirely.
    async fn delete_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()>;

    /// Pull the remaining unused allocation-id count, draining the shard's
    /// pool. The pull itself consumes one id, so the transferable remainder
    /// is one less than the returned count. Returns 0 on an empty pool.
    async fn poll_alloc_count(&self, ctx: &RequestContext, endpoint: &str) -> Result<u64>;

    /// Atomically grant `count` fresh ids on the endpoint.
    async fn grant_ids(&self, ctx: &RequestContext, endpoint: &str, count: u64) -> Result<()>;

    /// Names of all counters held on the endpoint.
    async fn list_counters(&self, ctx: &RequestContext, endpoint: &str) -> Result<Vec<String>>;

    /// Fetch a counter's range and current value. `NotFound` if absent.
    async fn fetch_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
    ) -> Result<CounterState>;

    /// Write a counter's range and current value.
    async fn store_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
        state: CounterState,
    ) -> Result<()>;

    /// Remove a counter from the endpoint.
    async fn delete_counter(&self, ctx: &RequestContext, endpoint: &str, name: &str) -> Result<()>;

    /// Request a full dump of the shard's data for this role to external
    /// cold storage at `dest_uri`.
    async fn backup_shard(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        dest_uri: &str,
    ) -> Result<()>;
}

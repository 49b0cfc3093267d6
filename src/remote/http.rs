//! HTTP implementation of the shard transport.
//!
//! Wire layout: every role shard exposes `/v1/keys`, `/v1/record`,
//! `/v1/index`, `/v1/allocids/*`, `/v1/counter*` and `/v1/backup` with the
//! role as a query parameter and bincode bodies. List endpoints accept a
//! key prefix and return a pagination cursor.

use crate::error::Result;
use crate::remote::requester::RemoteRequester;
use crate::remote::transport::{CounterState, KeyPage, ShardTransport, StoredIndexEntry};
use crate::types::{RequestContext, ShardRole};
use bytes::Bytes;
use reqwest::Method;

/// Production shard transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpShardTransport {
    requester: RemoteRequester,
}

impl HttpShardTransport {
    pub fn new(requester: RemoteRequester) -> Self {
        Self { requester }
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait::async_trait]
impl ShardTransport for HttpShardTransport {
    async fn list_keys(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        prefix: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<KeyPage> {
        let url = Self::url(endpoint, "v1/keys");
        let mut request = self
            .requester
            .request(Method::GET, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("prefix", prefix), ("limit", &limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_typed(response, &url).await
    }

    async fn fetch_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<Bytes> {
        let url = Self::url(endpoint, "v1/record");
        let request = self
            .requester
            .request(Method::GET, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("key", key)]);
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_bytes(response, &url).await
    }

    async fn store_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
        body: Bytes,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/record");
        let request = self
            .requester
            .request(Method::PUT, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("key", key)])
            .body(body.to_vec());
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn delete_record(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/record");
        let request = self
            .requester
            .request(Method::DELETE, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("key", key)]);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn fetch_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<StoredIndexEntry> {
        let url = Self::url(endpoint, "v1/index");
        let request = self
            .requester
            .request(Method::GET, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("key", key)]);
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_typed(response, &url).await
    }

    async fn store_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/index");
        let body = self.requester.encode(entry)?;
        let request = self
            .requester
            .request(Method::PUT, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("mode", "merge")])
            .body(body);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn replace_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        entry: &StoredIndexEntry,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/index");
        let body = self.requester.encode(entry)?;
        let request = self
            .requester
            .request(Method::PUT, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("mode", "replace")])
            .body(body);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn delete_index_entry(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        key: &str,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/index");
        let request = self
            .requester
            .request(Method::DELETE, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("key", key)]);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn poll_alloc_count(&self, ctx: &RequestContext, endpoint: &str) -> Result<u64> {
        let url = Self::url(endpoint, "v1/allocids/poll");
        let request = self.requester.request(Method::POST, &url, ctx);
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_typed(response, &url).await
    }

    async fn grant_ids(&self, ctx: &RequestContext, endpoint: &str, count: u64) -> Result<()> {
        let url = Self::url(endpoint, "v1/allocids/grant");
        let request = self
            .requester
            .request(Method::POST, &url, ctx)
            .query(&[("count", count.to_string())]);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn list_counters(&self, ctx: &RequestContext, endpoint: &str) -> Result<Vec<String>> {
        let url = Self::url(endpoint, "v1/counters");
        let request = self.requester.request(Method::GET, &url, ctx);
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_typed(response, &url).await
    }

    async fn fetch_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
    ) -> Result<CounterState> {
        let url = Self::url(endpoint, "v1/counter");
        let request = self
            .requester
            .request(Method::GET, &url, ctx)
            .query(&[("name", name)]);
        let response = self.requester.send(request, &url).await?;
        self.requester.recv_typed(response, &url).await
    }

    async fn store_counter(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        name: &str,
        state: CounterState,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/counter");
        let body = self.requester.encode(&state)?;
        let request = self
            .requester
            .request(Method::PUT, &url, ctx)
            .query(&[("name", name)])
            .body(body);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn delete_counter(&self, ctx: &RequestContext, endpoint: &str, name: &str) -> Result<()> {
        let url = Self::url(endpoint, "v1/counter");
        let request = self
            .requester
            .request(Method::DELETE, &url, ctx)
            .query(&[("name", name)]);
        self.requester.send(request, &url).await?;
        Ok(())
    }

    async fn backup_shard(
        &self,
        ctx: &RequestContext,
        endpoint: &str,
        role: ShardRole,
        dest_uri: &str,
    ) -> Result<()> {
        let url = Self::url(endpoint, "v1/backup");
        let request = self
            .requester
            .request(Method::POST, &url, ctx)
            .query(&[("role", role.to_string())])
            .query(&[("dest", dest_uri)]);
        self.requester.send(request, &url).await?;
        Ok(())
    }
}

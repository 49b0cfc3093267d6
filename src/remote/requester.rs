//! Typed RPC client for shard endpoints.
//!
//! Builds requests with the routing headers every shard expects, retries
//! transient I/O failures with bounded backoff, and classifies HTTP status
//! codes into the crate's error taxonomy.

use crate::config::GridConfig;
use crate::error::{Error, Result};
use crate::types::RequestContext;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Header carrying the tenant service name.
pub const HEADER_SERVICE: &str = "x-grid-service";
/// Header carrying the storage namespace.
pub const HEADER_NAMESPACE: &str = "x-grid-namespace";
/// Header marking the body encoding.
pub const HEADER_ENCODING: &str = "x-grid-encoding";

const ENCODING_BINCODE: &str = "bincode";

/// HTTP client wrapper for shard RPCs.
#[derive(Debug, Clone)]
pub struct RemoteRequester {
    client: reqwest::Client,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl RemoteRequester {
    pub fn new(config: &GridConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.remote_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            retry_attempts: config.remote_retry_attempts.max(1),
            retry_backoff: config.remote_retry_backoff,
        })
    }

    /// Start a request with the routing headers set.
    pub fn request(&self, method: Method, url: &str, ctx: &RequestContext) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(HEADER_SERVICE, &ctx.service)
            .header(HEADER_NAMESPACE, &ctx.namespace)
            .header(HEADER_ENCODING, ENCODING_BINCODE)
    }

    /// Send with bounded retry on transient failures.
    ///
    /// Connect errors, request timeouts, 408 and 5xx are retried up to the
    /// budget; 404 maps to `NotFound` and other 4xx to `InvalidRequest`,
    /// neither of which is retried.
    pub async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let cloned = request
                .try_clone()
                .ok_or_else(|| Error::Internal(format!("request to {url} is not retryable")))?;

            let err = match cloned.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    classify_status(status, url)
                }
                Err(e) if e.is_timeout() => Error::RemoteTimeout {
                    url: url.to_string(),
                },
                Err(e) => Error::RemoteUnavailable {
                    url: url.to_string(),
                    status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                },
            };

            if err.is_transient() && attempt < self.retry_attempts {
                tracing::warn!(url, attempt, error = %err, "shard request failed, retrying");
                tokio::time::sleep(self.retry_backoff).await;
            } else {
                return Err(err);
            }
        }
    }

    /// Read the full response body.
    pub async fn recv_bytes(&self, response: Response, url: &str) -> Result<Bytes> {
        response.bytes().await.map_err(|_| Error::RemoteUnavailable {
            url: url.to_string(),
            status: 0,
        })
    }

    /// Read and decode a bincode response body.
    pub async fn recv_typed<T: DeserializeOwned>(&self, response: Response, url: &str) -> Result<T> {
        let body = self.recv_bytes(response, url).await?;
        bincode::deserialize(&body).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Encode a bincode request body.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn classify_status(status: StatusCode, url: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(url.to_string()),
        StatusCode::REQUEST_TIMEOUT => Error::RemoteTimeout {
            url: url.to_string(),
        },
        s if s.is_server_error() => Error::RemoteUnavailable {
            url: url.to_string(),
            status: s.as_u16(),
        },
        s if s.is_client_error() => {
            Error::InvalidRequest(format!("{url} rejected with status {}", s.as_u16()))
        }
        s => Error::Internal(format!("{url} returned unexpected status {}", s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "http://s1/k"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, "http://s1/k"),
            Error::RemoteTimeout { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "http://s1/k"),
            Error::RemoteUnavailable { status: 500, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "http://s1/k"),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_transient_statuses_are_retryable() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "u").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "u").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "u").is_transient());
        assert!(!classify_status(StatusCode::FORBIDDEN, "u").is_transient());
    }
}

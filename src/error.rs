//! Error types for the sharded store core.

use thiserror::Error;

/// Result type alias for shard-grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for placement and migration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Request validation failed: unknown role, unknown shard name, or a
    /// change that would leave a role's pool empty. Rejected before any
    /// state mutation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Topology-cache refresh contention exhausted its retry budget.
    #[error("resource locked: {key}")]
    ResourceLocked { key: String },

    /// A revision-checked write observed a concurrent mutation. Surfaced to
    /// the caller, never retried automatically.
    #[error("optimistic conflict: expected revision {expected}, found {actual}")]
    OptimisticConflict { expected: u64, actual: u64 },

    /// The shard endpoint answered with a server error after the retry
    /// budget was spent.
    #[error("remote unavailable: {url} (status {status})")]
    RemoteUnavailable { url: String, status: u16 },

    /// The shard endpoint did not answer within the request timeout.
    #[error("remote timeout: {url}")]
    RemoteTimeout { url: String },

    /// A record was absent when a migrator tried to read it. Migrators log
    /// and skip this; a record may have been deleted concurrently.
    #[error("not found: {0}")]
    NotFound(String),

    /// Wire or persisted-record encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a migrator should skip the current record and continue.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the underlying remote call may succeed on a retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RemoteTimeout { .. } | Error::RemoteUnavailable { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

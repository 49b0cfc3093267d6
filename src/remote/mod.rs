//! Remote access to shard endpoints: the typed RPC client and the
//! transport seam the migration machinery is written against.

pub mod http;
pub mod requester;
pub mod transport;

pub use crate::types::RequestContext;
pub use http::HttpShardTransport;
pub use requester::RemoteRequester;
pub use transport::{CounterState, KeyPage, ShardTransport, StoredIndexEntry};

//! Shard topology: the authoritative registry, cached resolution, and the
//! single-flight cache both are built on.

pub mod cache;
pub mod resolver;
pub mod store;

pub use cache::SingleFlightCache;
pub use resolver::ShardTopologyResolver;
pub use store::{MemoryTopologyStore, TopologyStore};

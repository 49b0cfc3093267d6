//! Consistent hashing over shard endpoints.
//!
//! Placement is an immutable snapshot: a ring is built once per
//! (service, role) endpoint list and rebuilt, never mutated, whenever the
//! list changes. During a migration the old and the new ring coexist so a
//! migrator can ask "did this key move".

use md5::{Digest, Md5};
use std::collections::BTreeMap;

/// Default virtual replicas per physical endpoint. More replicas reduce
/// placement variance at the cost of ring memory.
pub const DEFAULT_RING_REPLICAS: usize = 300;

/// An immutable consistent hash ring mapping string keys onto one endpoint
/// of a fixed endpoint list.
///
/// Determinism: identical `(endpoints, replicas, key)` always yields the
/// same endpoint, independent of process or call order. Both sides of a
/// migration rely on this to agree on placement.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Ring positions -> index into `endpoints`.
    positions: BTreeMap<u128, usize>,
    /// Physical endpoints, in the order given at build time.
    endpoints: Vec<String>,
}

impl ConsistentHashRing {
    /// Build a ring over the given endpoints with the default replica count.
    pub fn new(endpoints: &[String]) -> Self {
        Self::build(endpoints, DEFAULT_RING_REPLICAS)
    }

    /// Build a ring with an explicit replica count.
    pub fn build(endpoints: &[String], replicas: usize) -> Self {
        let replicas = replicas.max(1);
        let endpoints: Vec<String> = endpoints.to_vec();
        let mut positions = BTreeMap::new();

        for (idx, endpoint) in endpoints.iter().enumerate() {
            for replica in 0..replicas {
                let position = Self::hash(format!("{endpoint}:{replica}").as_bytes());
                // On the (astronomically unlikely) MD5 collision the earlier
                // endpoint keeps the position; both rings resolve it the
                // same way, which preserves determinism.
                positions.entry(position).or_insert(idx);
            }
        }

        Self {
            positions,
            endpoints,
        }
    }

    /// Number of physical endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// The endpoint list this ring was built over.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Assign a key to its owning endpoint.
    ///
    /// Returns `None` only for an empty ring.
    pub fn assign(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = Self::hash(key.as_bytes());
        let idx = self
            .positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, &idx)| idx)?;
        Some(&self.endpoints[idx])
    }

    /// Whether `endpoint` owns `key` on this ring.
    pub fn owns(&self, key: &str, endpoint: &str) -> bool {
        self.assign(key) == Some(endpoint)
    }

    /// MD5 position on the ring.
    fn hash(data: &[u8]) -> u128 {
        let digest = Md5::digest(data);
        u128::from_be_bytes(digest.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = ConsistentHashRing::build(&[], 300);
        assert_eq!(ring.endpoint_count(), 0);
        assert!(ring.assign("key").is_none());
    }

    #[test]
    fn test_single_endpoint() {
        let ring = ConsistentHashRing::build(&endpoints(&["http://e1"]), 300);
        assert_eq!(ring.assign("any-key"), Some("http://e1"));
        assert!(ring.owns("any-key", "http://e1"));
    }

    #[test]
    fn test_determinism_across_builds() {
        let list = endpoints(&["http://e1", "http://e2", "http://e3"]);
        let a = ConsistentHashRing::build(&list, 300);
        let b = ConsistentHashRing::build(&list, 300);

        for i in 0..1000 {
            let key = format!("record/{i}");
            assert_eq!(a.assign(&key), b.assign(&key));
        }
    }

    #[test]
    fn test_determinism_independent_of_list_order() {
        // Placement depends on endpoint identity, not on list position.
        let a = ConsistentHashRing::build(&endpoints(&["http://e1", "http://e2"]), 300);
        let b = ConsistentHashRing::build(&endpoints(&["http://e2", "http://e1"]), 300);

        for i in 0..1000 {
            let key = format!("record/{i}");
            assert_eq!(a.assign(&key), b.assign(&key));
        }
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = ConsistentHashRing::build(&endpoints(&["http://e1", "http://e2", "http://e3"]), 300);

        let mut counts = std::collections::HashMap::new();
        for i in 0..9000 {
            let key = format!("sample/{i}");
            *counts.entry(ring.assign(&key).unwrap().to_string()).or_insert(0usize) += 1;
        }

        for endpoint in ring.endpoints() {
            let count = counts.get(endpoint).copied().unwrap_or(0);
            // Expected 3000 per endpoint; allow generous variance.
            assert!(
                (1800..=4200).contains(&count),
                "{endpoint} got {count} keys"
            );
        }
    }

    #[test]
    fn test_minimal_disruption_on_add() {
        // Adding one endpoint to a ring of N moves about 1/(N+1) of keys.
        let old = ConsistentHashRing::build(
            &endpoints(&["http://e1", "http://e2", "http://e3"]),
            300,
        );
        let new = ConsistentHashRing::build(
            &endpoints(&["http://e1", "http://e2", "http://e3", "http://e4"]),
            300,
        );

        let sample = 10_000;
        let mut moved = 0usize;
        for i in 0..sample {
            let key = format!("record/{i}");
            let before = old.assign(&key).unwrap();
            let after = new.assign(&key).unwrap();
            if before != after {
                moved += 1;
                // Every moved key must land on the new endpoint.
                assert_eq!(after, "http://e4");
            }
        }

        let fraction = moved as f64 / sample as f64;
        // Classic bound is 1/(N+1) = 0.25; allow statistical slack.
        assert!(fraction < 0.35, "moved fraction {fraction} too high");
        assert!(fraction > 0.10, "moved fraction {fraction} suspiciously low");
    }

    #[test]
    fn test_assign_is_pure() {
        let ring = ConsistentHashRing::build(&endpoints(&["http://e1", "http://e2"]), 300);
        let first = ring.assign("stable-key").map(str::to_string);
        for _ in 0..100 {
            assert_eq!(ring.assign("stable-key").map(str::to_string), first);
        }
    }
}

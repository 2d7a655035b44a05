//! Canonical lock order
//!
//! Every pessimistic transaction requests its locks in ascending `LockKey`
//! order: partition id, then key hash, then the key itself. With a single
//! total order no two transactions can wait on each other in a cycle.

use crate::common::{key_hash, PartitionId};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub partition: PartitionId,
    pub hash: u64,
    pub key: String,
}

impl LockKey {
    pub fn new(partition: PartitionId, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            partition,
            hash: key_hash(&key),
            key,
        }
    }
}

impl Ord for LockKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partition
            .cmp(&other.partition)
            .then(self.hash.cmp(&other.hash))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for LockKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort keys into canonical order and drop duplicates
pub fn canonical_order(mut keys: Vec<LockKey>) -> Vec<LockKey> {
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_dominates() {
        let a = LockKey::new(1, "zzz");
        let b = LockKey::new(2, "aaa");
        assert!(a < b);
    }

    #[test]
    fn test_hash_orders_within_partition() {
        let a = LockKey::new(0, "alpha");
        let b = LockKey::new(0, "beta");
        assert_eq!(a.cmp(&b), a.hash.cmp(&b.hash));
    }

    #[test]
    fn test_canonical_order_dedups() {
        let keys = vec![
            LockKey::new(3, "c"),
            LockKey::new(1, "a"),
            LockKey::new(3, "c"),
            LockKey::new(2, "b"),
        ];
        let ordered = canonical_order(keys);
        assert_eq!(ordered.len(), 3);
        assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    }
}

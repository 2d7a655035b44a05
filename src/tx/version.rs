//! Entry versions and the per-node version authority
//!
//! A version is `(order, node_order)`. `order` is a Lamport counter owned by
//! one node; `node_order` is that node's join order and makes versions from
//! different nodes distinct. Each transaction gets its commit version from
//! exactly one authority: the node coordinating it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub order: u64,
    pub node_order: u32,
}

impl Version {
    /// Version of an entry that was never written
    pub const ZERO: Version = Version {
        order: 0,
        node_order: 0,
    };

    pub fn new(order: u64, node_order: u32) -> Self {
        Self { order, node_order }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.order, self.node_order)
    }
}

/// Version generator for one node
///
/// `next` is the only writer of new orders on this node; `observe` merges in
/// versions seen from other nodes so that later versions sort after them.
#[derive(Debug)]
pub struct VersionAuthority {
    node_order: u32,
    order: AtomicU64,
}

impl VersionAuthority {
    pub fn new(node_order: u32) -> Self {
        Self {
            node_order,
            order: AtomicU64::new(0),
        }
    }

    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    /// Allocate a fresh version, greater than anything allocated or observed so far
    pub fn next(&self) -> Version {
        let order = self.order.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(order, self.node_order)
    }

    /// Merge a version seen from elsewhere
    pub fn observe(&self, version: Version) {
        self.order.fetch_max(version.order, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.order.load(Ordering::SeqCst)
    }
}

//! Affinity: key → partition → ordered owner list
//!
//! Keys are assigned to partitions by hashing, and partitions to nodes with
//! HRW hashing. The first topology places every partition by HRW rank; later
//! changes keep surviving owners and only fill vacated slots.

pub mod partition_map;
pub mod topology;

pub use partition_map::{Owners, PartitionMap};
pub use topology::{Reassignment, TopologyEvent, TopologyFeed};

use crate::common::{partition_of, select_owners, NodeId, PartitionId};

/// Deterministic placement function for one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityFunction {
    partitions: u32,
    backups: usize,
}

impl AffinityFunction {
    pub fn new(partitions: u32, backups: usize) -> Self {
        Self {
            partitions,
            backups,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn backups(&self) -> usize {
        self.backups
    }

    /// Partition of a key. Independent of the node set.
    pub fn partition_of(&self, key: &str) -> PartitionId {
        partition_of(key, self.partitions)
    }

    /// Owners of a partition for a node set: primary first, then backups
    pub fn owners_of(&self, partition: PartitionId, nodes: &[NodeId]) -> Vec<NodeId> {
        select_owners(partition, nodes, self.backups + 1)
    }

    /// Every node ranked for a partition, best first
    pub fn ranked(&self, partition: PartitionId, nodes: &[NodeId]) -> Vec<NodeId> {
        select_owners(partition, nodes, nodes.len())
    }

    /// Full assignment for a node set, indexed by partition id
    pub fn assign(&self, nodes: &[NodeId]) -> Vec<Vec<NodeId>> {
        (0..self.partitions)
            .map(|partition| self.owners_of(partition, nodes))
            .collect()
    }
}

//! Per-node partition map
//!
//! Authoritative table of partition → owner list for one cache, updated on
//! every topology event. The first event places partitions by affinity; after
//! that owners that are still members keep their partitions in order (a
//! backup is promoted when the primary leaves) and vacated backup slots go to
//! the best-ranked remaining nodes. A partition that lost every owner stays
//! unavailable. Every lookup is stamped with the topology version it was
//! answered at.

use super::{AffinityFunction, TopologyEvent};
use crate::common::{Error, NodeId, PartitionId, Result};
use std::collections::HashSet;

/// Owners of a partition as seen at one topology version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owners {
    pub partition: PartitionId,
    pub topology_version: u64,
    /// Primary first, then backups
    pub nodes: Vec<NodeId>,
}

impl Owners {
    pub fn primary(&self) -> &NodeId {
        // Owners are only built for non-empty owner lists
        &self.nodes[0]
    }

    pub fn backups(&self) -> &[NodeId] {
        &self.nodes[1..]
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }
}

#[derive(Debug, Clone)]
pub struct PartitionMap {
    cache: String,
    affinity: AffinityFunction,
    version: u64,
    nodes: Vec<NodeId>,
    /// Indexed by partition id
    assignment: Vec<Vec<NodeId>>,
    /// Partitions being transferred by the rebalancer
    frozen: HashSet<PartitionId>,
}

impl PartitionMap {
    pub fn new(cache: impl Into<String>, affinity: AffinityFunction) -> Self {
        Self {
            cache: cache.into(),
            affinity,
            version: 0,
            nodes: Vec::new(),
            assignment: vec![Vec::new(); affinity.partitions() as usize],
            frozen: HashSet::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn affinity(&self) -> &AffinityFunction {
        &self.affinity
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Apply a topology event. Returns false if the event is not newer.
    pub fn apply(&mut self, event: &TopologyEvent) -> bool {
        if event.version <= self.version {
            return false;
        }

        let initial = self.version == 0;
        self.version = event.version;
        self.nodes = event.nodes.clone();
        self.assignment = if initial {
            self.affinity.assign(&self.nodes)
        } else {
            (0..self.affinity.partitions())
                .map(|partition| self.carry_over(partition))
                .collect()
        };

        for reassignment in event
            .reassignments
            .iter()
            .filter(|r| r.cache == self.cache)
        {
            if let Some(slot) = self.assignment.get_mut(reassignment.partition as usize) {
                *slot = reassignment.owners.clone();
            }
        }

        tracing::debug!(
            "Partition map for '{}' updated to v{} ({} nodes)",
            self.cache,
            self.version,
            self.nodes.len()
        );
        true
    }

    fn carry_over(&self, partition: PartitionId) -> Vec<NodeId> {
        let previous = self
            .assignment
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut owners: Vec<NodeId> = previous
            .iter()
            .filter(|node| self.nodes.contains(node))
            .cloned()
            .collect();

        if owners.is_empty() {
            if !previous.is_empty() {
                tracing::warn!(
                    "Partition {} of '{}' lost every owner at v{}",
                    partition,
                    self.cache,
                    self.version
                );
            }
            return owners;
        }

        let wanted = self.affinity.backups() + 1;
        for node in self.affinity.ranked(partition, &self.nodes) {
            if owners.len() >= wanted {
                break;
            }
            if !owners.contains(&node) {
                owners.push(node);
            }
        }
        owners
    }

    /// Owner lists indexed by partition id
    pub fn assignment(&self) -> &[Vec<NodeId>] {
        &self.assignment
    }

    pub fn partition_of(&self, key: &str) -> PartitionId {
        self.affinity.partition_of(key)
    }

    /// Owners of a partition, or `PartitionUnavailable` if no owner is left
    /// or the partition is frozen for transfer.
    pub fn owners(&self, partition: PartitionId) -> Result<Owners> {
        let unavailable = || Error::PartitionUnavailable {
            cache: self.cache.clone(),
            partition,
        };

        if self.frozen.contains(&partition) {
            return Err(unavailable());
        }

        match self.assignment.get(partition as usize) {
            Some(nodes) if !nodes.is_empty() => Ok(Owners {
                partition,
                topology_version: self.version,
                nodes: nodes.clone(),
            }),
            _ => Err(unavailable()),
        }
    }

    pub fn owners_of_key(&self, key: &str) -> Result<Owners> {
        self.owners(self.partition_of(key))
    }

    pub fn is_primary(&self, node: &str, partition: PartitionId) -> bool {
        self.assignment
            .get(partition as usize)
            .and_then(|nodes| nodes.first())
            .map(|primary| primary == node)
            .unwrap_or(false)
    }

    pub fn freeze(&mut self, partition: PartitionId) {
        self.frozen.insert(partition);
    }

    pub fn unfreeze(&mut self, partition: PartitionId) {
        self.frozen.remove(&partition);
    }

    pub fn is_frozen(&self, partition: PartitionId) -> bool {
        self.frozen.contains(&partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::Reassignment;

    fn event(version: u64, nodes: &[&str]) -> TopologyEvent {
        TopologyEvent {
            version,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            reassignments: vec![],
        }
    }

    fn map() -> PartitionMap {
        PartitionMap::new("test", AffinityFunction::new(32, 1))
    }

    #[test]
    fn test_unavailable_before_topology() {
        let map = map();
        assert!(matches!(
            map.owners(0),
            Err(Error::PartitionUnavailable { partition: 0, .. })
        ));
    }

    #[test]
    fn test_apply_ignores_old_versions() {
        let mut map = map();
        assert!(map.apply(&event(2, &["a", "b"])));
        assert!(!map.apply(&event(2, &["a"])));
        assert!(!map.apply(&event(1, &["a"])));
        assert_eq!(map.nodes().len(), 2);
        assert_eq!(map.version(), 2);
    }

    #[test]
    fn test_owners_stamped_with_version() {
        let mut map = map();
        map.apply(&event(5, &["a", "b", "c"]));
        let owners = map.owners_of_key("k1").unwrap();
        assert_eq!(owners.topology_version, 5);
        assert_eq!(owners.nodes.len(), 2);
        assert!(map.is_primary(owners.primary(), owners.partition));
    }

    #[test]
    fn test_backup_promoted_when_primary_leaves() {
        let mut map = map();
        map.apply(&event(1, &["a", "b", "c"]));
        let before = map.owners(7).unwrap();

        let remaining: Vec<&str> = ["a", "b", "c"]
            .into_iter()
            .filter(|n| *n != before.primary().as_str())
            .collect();
        map.apply(&event(2, &remaining));

        let after = map.owners(7).unwrap();
        assert_eq!(after.primary(), &before.backups()[0]);
    }

    #[test]
    fn test_frozen_partition_unavailable() {
        let mut map = map();
        map.apply(&event(1, &["a", "b"]));
        map.freeze(3);
        assert!(map.owners(3).is_err());
        map.unfreeze(3);
        assert!(map.owners(3).is_ok());
    }

    #[test]
    fn test_reassignment_overrides_affinity() {
        let mut map = map();
        let mut e = event(1, &["a", "b", "c"]);
        e.reassignments.push(Reassignment {
            cache: "test".into(),
            partition: 4,
            owners: vec!["c".into(), "b".into()],
        });
        e.reassignments.push(Reassignment {
            cache: "other".into(),
            partition: 5,
            owners: vec!["a".into()],
        });
        map.apply(&e);
        assert_eq!(map.owners(4).unwrap().nodes, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(map.owners(5).unwrap().nodes.len(), 2);
    }

    #[test]
    fn test_join_keeps_owners() {
        let mut map = map();
        map.apply(&event(1, &["a", "b", "c"]));
        let before = map.assignment().to_vec();

        map.apply(&event(2, &["a", "b", "c", "d"]));
        assert_eq!(map.assignment(), before.as_slice());
    }

    #[test]
    fn test_joiner_fills_missing_backup() {
        let mut map = map();
        map.apply(&event(1, &["a"]));
        map.apply(&event(2, &["a", "b"]));
        for partition in 0..32 {
            let owners = map.owners(partition).unwrap();
            assert_eq!(owners.primary(), "a");
            assert_eq!(owners.backups(), ["b".to_string()]);
        }
    }

    #[test]
    fn test_leaving_backup_replaced() {
        let mut map = map();
        map.apply(&event(1, &["a", "b", "c"]));
        let before = map.owners(9).unwrap();
        let backup = before.backups()[0].clone();

        let remaining: Vec<&str> = ["a", "b", "c"]
            .into_iter()
            .filter(|n| *n != backup)
            .collect();
        map.apply(&event(2, &remaining));

        let after = map.owners(9).unwrap();
        assert_eq!(after.primary(), before.primary());
        assert_eq!(after.nodes.len(), 2);
        assert!(!after.contains(&backup));
    }

    #[test]
    fn test_partition_unavailable_when_every_owner_leaves() {
        let mut map = map();
        map.apply(&event(1, &["a", "b", "c", "d"]));
        let owners = map.owners(3).unwrap();

        let remaining: Vec<&str> = ["a", "b", "c", "d"]
            .into_iter()
            .filter(|n| !owners.contains(n))
            .collect();
        map.apply(&event(2, &remaining));
        assert!(matches!(
            map.owners(3),
            Err(Error::PartitionUnavailable { partition: 3, .. })
        ));

        // Rejoining nodes do not bring the partition back
        map.apply(&event(3, &["a", "b", "c", "d"]));
        assert!(map.owners(3).is_err());
    }

    #[test]
    fn test_all_owners_gone() {
        let mut map = map();
        map.apply(&event(1, &["a"]));
        map.apply(&event(2, &[]));
        assert!(map.owners_of_key("k").is_err());
    }
}

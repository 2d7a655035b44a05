//! Membership/topology feed
//!
//! Membership is supplied from outside the engine as a stream of
//! `(version, node set)` events. Versions only grow: a node ignores any event
//! that is not newer than the one it already applied.

use crate::common::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Partition ownership pinned by the rebalancer, overriding affinity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassignment {
    pub cache: String,
    pub partition: PartitionId,
    pub owners: Vec<NodeId>,
}

/// One membership/ownership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub version: u64,
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub reassignments: Vec<Reassignment>,
}

/// Publishing side of the topology stream
///
/// Keeps the current node set and any rebalancer reassignments, and bumps the
/// version on every change.
pub struct TopologyFeed {
    tx: watch::Sender<TopologyEvent>,
    pinned: BTreeMap<(String, PartitionId), Vec<NodeId>>,
}

impl TopologyFeed {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TopologyEvent::default());
        Self {
            tx,
            pinned: BTreeMap::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TopologyEvent> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> TopologyEvent {
        self.tx.borrow().clone()
    }

    /// Publish a new node set. Pinned partitions whose owners left are unpinned.
    pub fn publish_nodes(&mut self, nodes: Vec<NodeId>) -> TopologyEvent {
        self.pinned
            .retain(|_, owners| owners.iter().all(|owner| nodes.contains(owner)));
        self.publish(nodes)
    }

    /// Pin a partition to explicit owners (primary first)
    pub fn publish_reassignment(&mut self, reassignment: Reassignment) -> TopologyEvent {
        let nodes = self.tx.borrow().nodes.clone();
        self.pinned.insert(
            (reassignment.cache, reassignment.partition),
            reassignment.owners,
        );
        self.publish(nodes)
    }

    fn publish(&mut self, nodes: Vec<NodeId>) -> TopologyEvent {
        let version = self.tx.borrow().version + 1;
        let event = TopologyEvent {
            version,
            nodes,
            reassignments: self
                .pinned
                .iter()
                .map(|((cache, partition), owners)| Reassignment {
                    cache: cache.clone(),
                    partition: *partition,
                    owners: owners.clone(),
                })
                .collect(),
        };
        tracing::info!(
            "Topology v{}: {} node(s), {} pinned partition(s)",
            event.version,
            event.nodes.len(),
            event.reassignments.len()
        );
        self.tx.send_replace(event.clone());
        event
    }
}

impl Default for TopologyFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_increase() {
        let mut feed = TopologyFeed::new();
        let e1 = feed.publish_nodes(vec!["a".into(), "b".into()]);
        let e2 = feed.publish_nodes(vec!["a".into()]);
        assert_eq!(e1.version, 1);
        assert_eq!(e2.version, 2);
        assert_eq!(feed.current(), e2);
    }

    #[test]
    fn test_reassignment_dropped_when_owner_leaves() {
        let mut feed = TopologyFeed::new();
        feed.publish_nodes(vec!["a".into(), "b".into(), "c".into()]);
        let event = feed.publish_reassignment(Reassignment {
            cache: "c1".into(),
            partition: 3,
            owners: vec!["c".into(), "a".into()],
        });
        assert_eq!(event.reassignments.len(), 1);

        let event = feed.publish_nodes(vec!["a".into(), "b".into()]);
        assert!(event.reassignments.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_observe_latest() {
        let mut feed = TopologyFeed::new();
        let mut rx = feed.subscribe();
        feed.publish_nodes(vec!["a".into()]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 1);
    }
}

//! In-process cluster harness
//!
//! Starts a set of peer nodes sharing one transport, one topology feed and one
//! commit-notification bus. Membership changes go through the feed, and the
//! harness copies partition data onto owners a change added; crashes and
//! isolation are injected without touching membership, the way a real
//! failure looks before discovery notices it.

use super::cache::Cache;
use crate::affinity::{Owners, Reassignment, TopologyFeed};
use crate::common::{Error, GridConfig, NodeId, PartitionId, Result};
use crate::near::CommitNotification;
use crate::node::{NodeContext, NodeServer, Request, Response, Transport};
use crate::store::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// How long a membership change may take to reach every live node
const TOPOLOGY_WAIT: Duration = Duration::from_secs(5);

const COMMIT_BUS_CAPACITY: usize = 4096;

pub struct Cluster {
    config: Arc<GridConfig>,
    transport: Arc<Transport>,
    commits: broadcast::Sender<CommitNotification>,
    feed: TopologyFeed,
    members: BTreeMap<NodeId, NodeServer>,
    /// Stopped nodes that are still members
    crashed: BTreeSet<NodeId>,
    next_order: u32,
}

impl Cluster {
    /// Start `nodes` peers and publish them as the first topology
    pub async fn start(config: GridConfig, nodes: usize) -> Result<Self> {
        config.validate()?;
        if nodes == 0 {
            return Err(Error::InvalidConfig(
                "a cluster needs at least one node".into(),
            ));
        }

        let config = Arc::new(config);
        let (commits, _) = broadcast::channel(COMMIT_BUS_CAPACITY);
        let mut cluster = Self {
            transport: Arc::new(Transport::new(config.rpc_timeout())),
            config,
            commits,
            feed: TopologyFeed::new(),
            members: BTreeMap::new(),
            crashed: BTreeSet::new(),
            next_order: 1,
        };

        for _ in 0..nodes {
            cluster.spawn_node();
        }
        cluster.publish_membership().await?;
        tracing::info!(
            "Cluster started with {} node(s) and {} cache(s)",
            nodes,
            cluster.config.caches.len()
        );
        Ok(cluster)
    }

    fn spawn_node(&mut self) -> NodeId {
        let order = self.next_order;
        self.next_order += 1;
        let id = format!("node-{}", order);

        let ctx = Arc::new(NodeContext::new(
            id.clone(),
            order,
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            self.commits.clone(),
        ));
        if let Some(member) = self.members.values().next() {
            for cache in ctx.caches() {
                if let Ok(current) = member.context().cache(cache.name()) {
                    cache.adopt_map(current.map().clone());
                }
            }
        }
        let server = NodeServer::start(ctx, self.feed.subscribe());
        self.members.insert(id.clone(), server);
        id
    }

    fn membership(&self) -> Vec<NodeId> {
        self.members
            .keys()
            .chain(self.crashed.iter())
            .cloned()
            .collect()
    }

    async fn publish_membership(&mut self) -> Result<u64> {
        let before = self.assignments()?;
        let event = self.feed.publish_nodes(self.membership());
        self.wait_for_topology(event.version).await?;
        self.fill_new_owners(&before)?;
        Ok(event.version)
    }

    /// Owner lists per cache as the first live node sees them
    fn assignments(&self) -> Result<BTreeMap<String, Vec<Vec<NodeId>>>> {
        let mut assignments = BTreeMap::new();
        if let Some(server) = self.members.values().next() {
            for cache in &self.config.caches {
                let context = server.context().cache(&cache.name)?;
                let owners = context.map().assignment().to_vec();
                assignments.insert(cache.name.clone(), owners);
            }
        }
        Ok(assignments)
    }

    /// Copy each partition's entries onto owners that did not hold it before
    /// the last membership change.
    ///
    /// Runs after every live node applied the change, so commits the snapshot
    /// misses already replicate to the new owners; import keeps the newer
    /// version per key.
    fn fill_new_owners(&self, before: &BTreeMap<String, Vec<Vec<NodeId>>>) -> Result<()> {
        let after = self.assignments()?;
        for (cache, owner_lists) in &after {
            let Some(previous) = before.get(cache) else {
                continue;
            };
            for (partition, owners) in owner_lists.iter().enumerate() {
                let held = match previous.get(partition) {
                    Some(held) if !held.is_empty() => held,
                    _ => continue,
                };
                let fresh: Vec<&NodeId> = owners.iter().filter(|n| !held.contains(n)).collect();
                if fresh.is_empty() {
                    continue;
                }

                let partition = partition as PartitionId;
                let source = owners
                    .iter()
                    .find(|n| held.contains(n) && self.members.contains_key(*n));
                let Some(source) = source else {
                    tracing::warn!(
                        "No live owner left to copy partition {} of '{}' from",
                        partition,
                        cache
                    );
                    continue;
                };
                let entries = self.node(source)?.cache(cache)?.store(partition)?.export();

                for node in fresh {
                    let Some(server) = self.members.get(node) else {
                        continue;
                    };
                    let copied = server
                        .context()
                        .cache(cache)?
                        .store(partition)?
                        .import(entries.clone());
                    tracing::debug!(
                        "Copied {} entries of partition {} of '{}' from {} to {}",
                        copied,
                        partition,
                        cache,
                        source,
                        node
                    );
                }
            }
        }
        Ok(())
    }

    async fn wait_for_topology(&self, version: u64) -> Result<()> {
        for server in self.members.values() {
            server.wait_for_topology(version, TOPOLOGY_WAIT).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn topology_version(&self) -> u64 {
        self.feed.current().version
    }

    /// Live nodes, in id order
    pub fn nodes(&self) -> Vec<NodeId> {
        self.members.keys().cloned().collect()
    }

    fn server(&self, node: &str) -> Result<&NodeServer> {
        self.members
            .get(node)
            .ok_or_else(|| Error::NodeUnreachable(node.to_string()))
    }

    pub fn node(&self, node: &str) -> Result<&Arc<NodeContext>> {
        Ok(self.server(node)?.context())
    }

    /// Handle on cache `name`, coordinating from `node`
    pub fn cache(&self, node: &str, name: &str) -> Result<Cache> {
        let ctx = self.node(node)?;
        let cache = ctx.cache(name)?;
        Ok(Cache::new(Arc::clone(ctx), cache))
    }

    /// Join a new node and wait until every live node has seen it
    pub async fn add_node(&mut self) -> Result<NodeId> {
        let id = self.spawn_node();
        self.publish_membership().await?;
        Ok(id)
    }

    /// Remove a node from membership, stopping it if it is still running
    pub async fn leave(&mut self, node: &str) -> Result<()> {
        self.leave_all(&[node]).await
    }

    /// Remove several nodes in one membership change
    pub async fn leave_all(&mut self, nodes: &[&str]) -> Result<()> {
        for node in nodes {
            if !self.members.contains_key(*node) && !self.crashed.contains(*node) {
                return Err(Error::NodeUnreachable(node.to_string()));
            }
        }
        for node in nodes {
            if let Some(server) = self.members.remove(*node) {
                server.stop();
            }
            self.crashed.remove(*node);
            tracing::info!("Node {} left the cluster", node);
        }
        self.publish_membership().await?;
        Ok(())
    }

    /// Stop a node without a membership change. Requests to it fail as unreachable.
    pub fn crash(&mut self, node: &str) -> Result<()> {
        let server = self
            .members
            .remove(node)
            .ok_or_else(|| Error::NodeUnreachable(node.to_string()))?;
        tracing::warn!("Crashing node {}", node);
        server.stop();
        self.crashed.insert(node.to_string());
        Ok(())
    }

    /// Keep a node in membership but stop it from answering; callers time out
    pub fn isolate(&self, node: &str) -> Result<()> {
        self.server(node)?.isolate();
        Ok(())
    }

    pub fn heal(&self, node: &str) -> Result<()> {
        self.server(node)?.heal();
        Ok(())
    }

    /// Owners of `key` as the first live node sees them
    pub fn owners(&self, cache: &str, key: &str) -> Result<Owners> {
        let server = self
            .members
            .values()
            .next()
            .ok_or_else(|| Error::Internal("no live nodes".into()))?;
        let cache = server.context().cache(cache)?;
        let owners = cache.map().owners_of_key(key)?;
        Ok(owners)
    }

    /// Committed entry for `key` held by `node`, tombstones included
    pub fn entry(&self, node: &str, cache: &str, key: &str) -> Result<Option<Entry>> {
        let cache = self.node(node)?.cache(cache)?;
        let partition = cache.map().partition_of(key);
        let entry = cache.store(partition)?.entry(key).cloned();
        Ok(entry)
    }

    /// Send a raw request between nodes, as a redelivering sender would
    pub async fn send(&self, from: &str, to: &str, request: &Request) -> Result<Response> {
        self.transport.call(from, to, request).await
    }

    /// Stop serving `partition` on every live node
    pub fn freeze_partition(&self, cache: &str, partition: PartitionId) -> Result<()> {
        for server in self.members.values() {
            server.context().cache(cache)?.freeze_partition(partition)?;
        }
        Ok(())
    }

    pub fn unfreeze_partition(&self, cache: &str, partition: PartitionId) -> Result<()> {
        for server in self.members.values() {
            server.context().cache(cache)?.unfreeze_partition(partition)?;
        }
        Ok(())
    }

    /// Rebalancer hook: move the primary copy of a partition to `target`.
    ///
    /// The partition is frozen everywhere, the current primary's entries are
    /// imported on the target, the new ownership is published and the
    /// partition is unfrozen once every live node has applied it. Requests
    /// for the partition in between fail with `PartitionUnavailable`.
    pub async fn transfer_partition(
        &mut self,
        cache: &str,
        partition: PartitionId,
        target: &str,
    ) -> Result<()> {
        let target_cache = self.node(target)?.cache(cache)?;
        let (owners, backups) = {
            let map = target_cache.map();
            (map.owners(partition)?, map.affinity().backups())
        };
        let source = owners.primary().clone();
        if source == target {
            return Ok(());
        }
        self.node(&source)?;

        tracing::info!(
            "Transferring partition {} of '{}' from {} to {}",
            partition,
            cache,
            source,
            target
        );
        let mut entries = Vec::new();
        for (id, server) in &self.members {
            let frozen = server.context().cache(cache)?.freeze_partition(partition)?;
            if *id == source {
                entries = frozen;
            }
        }
        let moved = target_cache.store(partition)?.import(entries);

        let mut new_owners = vec![target.to_string()];
        new_owners.extend(owners.nodes.iter().filter(|n| *n != target).cloned());
        new_owners.truncate(backups + 1);

        let event = self.feed.publish_reassignment(Reassignment {
            cache: cache.to_string(),
            partition,
            owners: new_owners,
        });
        let published = self.wait_for_topology(event.version).await;
        self.unfreeze_partition(cache, partition)?;
        published?;

        tracing::info!(
            "Partition {} of '{}' now led by {} ({} entries moved)",
            partition,
            cache,
            target,
            moved
        );
        Ok(())
    }

    /// Wait until no live node has background replication or commit work left
    pub async fn quiesce(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: usize = self
                .members
                .values()
                .map(|server| server.context().background_tasks())
                .sum();
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} background task(s) still running after {:?}",
                    pending, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Prometheus text for every live node
    pub fn metrics(&self) -> String {
        self.members
            .iter()
            .map(|(id, server)| server.context().metrics.to_prometheus(id))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn shutdown(mut self) {
        tracing::info!("Shutting down cluster");
        for (_, server) in std::mem::take(&mut self.members) {
            server.stop();
        }
    }
}

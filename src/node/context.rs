//! Per-node state
//!
//! A `NodeContext` owns everything one node holds: its version authority, its
//! metrics and, for each configured cache, a `CacheContext` with the node's
//! partition map, the arena of partition stores, the lock manager and the
//! participant transaction table.
//!
//! Lock order inside a cache context: `txs`, then `map`, then the lock
//! manager, then a partition store.

use crate::affinity::{AffinityFunction, PartitionMap, TopologyEvent};
use crate::common::utils::{lock, read, write};
use crate::common::{CacheConfig, Error, GridConfig, NodeId, PartitionId, Result, TxMetrics};
use crate::lock::LockManager;
use crate::near::{CommitNotification, NearCache};
use crate::node::messages::{Request, Response};
use crate::node::transport::Transport;
use crate::store::PartitionStore;
use crate::tx::{TxTable, VersionAuthority};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub struct CacheContext {
    config: CacheConfig,
    map: RwLock<PartitionMap>,
    stores: Vec<Mutex<PartitionStore>>,
    pub locks: LockManager,
    pub txs: Mutex<TxTable>,
    near: Option<Arc<NearCache>>,
}

impl CacheContext {
    pub fn new(config: CacheConfig, finished_capacity: usize) -> Self {
        let affinity = AffinityFunction::new(config.partitions, config.backups);
        let stores = (0..config.partitions)
            .map(|p| Mutex::new(PartitionStore::new(config.name.clone(), p)))
            .collect();
        let near = config
            .near_cache
            .as_ref()
            .map(|near| Arc::new(NearCache::new(config.name.clone(), near.capacity)));

        Self {
            map: RwLock::new(PartitionMap::new(config.name.clone(), affinity)),
            stores,
            locks: LockManager::new(),
            txs: Mutex::new(TxTable::new(finished_capacity)),
            near,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn map(&self) -> RwLockReadGuard<'_, PartitionMap> {
        read(&self.map)
    }

    pub fn topology_version(&self) -> u64 {
        self.map().version()
    }

    pub fn apply_topology(&self, event: &TopologyEvent) -> bool {
        write(&self.map).apply(event)
    }

    /// Replace the partition map wholesale; a joining node takes the one
    /// the members already agree on
    pub fn adopt_map(&self, map: PartitionMap) {
        *write(&self.map) = map;
    }

    pub fn near(&self) -> Option<&Arc<NearCache>> {
        self.near.as_ref()
    }

    pub fn store(&self, partition: PartitionId) -> Result<MutexGuard<'_, PartitionStore>> {
        self.stores
            .get(partition as usize)
            .map(lock)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "partition {} out of range for cache '{}'",
                    partition, self.config.name
                ))
            })
    }

    /// Refuse work for a partition this node does not currently lead.
    ///
    /// A sender that mapped the partition here with an older topology is
    /// still served as long as this node remains the primary. A sender ahead
    /// of this node gets `StaleTopology` and retries once the node has caught up.
    pub fn check_primary(
        &self,
        node: &str,
        partition: PartitionId,
        topology_version: u64,
    ) -> Result<()> {
        let map = self.map();
        if map.is_frozen(partition) {
            return Err(Error::PartitionUnavailable {
                cache: self.config.name.clone(),
                partition,
            });
        }
        if topology_version > map.version() || !map.is_primary(node, partition) {
            return Err(Error::StaleTopology {
                used: topology_version,
                current: map.version(),
            });
        }
        Ok(())
    }

    /// Rebalancer hook: stop serving a partition and hand out its entries
    pub fn freeze_partition(&self, partition: PartitionId) -> Result<Vec<crate::store::Entry>> {
        write(&self.map).freeze(partition);
        Ok(self.store(partition)?.freeze())
    }

    pub fn unfreeze_partition(&self, partition: PartitionId) -> Result<()> {
        write(&self.map).unfreeze(partition);
        self.store(partition)?.unfreeze();
        Ok(())
    }
}

pub struct NodeContext {
    pub id: NodeId,
    pub config: Arc<GridConfig>,
    pub versions: VersionAuthority,
    pub transport: Arc<Transport>,
    pub commits: broadcast::Sender<CommitNotification>,
    pub metrics: TxMetrics,
    caches: HashMap<String, Arc<CacheContext>>,
    topology: AtomicU64,
    background: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl NodeContext {
    pub fn new(
        id: impl Into<NodeId>,
        node_order: u32,
        config: Arc<GridConfig>,
        transport: Arc<Transport>,
        commits: broadcast::Sender<CommitNotification>,
    ) -> Self {
        let caches = config
            .caches
            .iter()
            .map(|cache| {
                (
                    cache.name.clone(),
                    Arc::new(CacheContext::new(cache.clone(), config.finished_tx_capacity)),
                )
            })
            .collect();

        Self {
            id: id.into(),
            versions: VersionAuthority::new(node_order),
            transport,
            commits,
            metrics: TxMetrics::new(),
            caches,
            topology: AtomicU64::new(0),
            background: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            config,
        }
    }

    pub fn cache(&self, name: &str) -> Result<Arc<CacheContext>> {
        self.caches
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCache(name.to_string()))
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<CacheContext>> {
        self.caches.values()
    }

    pub fn apply_topology(&self, event: &TopologyEvent) {
        let mut changed = false;
        for cache in self.caches.values() {
            changed |= cache.apply_topology(event);
        }
        self.topology.fetch_max(event.version, Ordering::SeqCst);
        if changed {
            tracing::info!(
                "Node {} applied topology v{} ({} nodes)",
                self.id,
                event.version,
                event.nodes.len()
            );
        }
    }

    /// Latest topology version this node has applied
    pub fn topology_version(&self) -> u64 {
        self.topology.load(Ordering::SeqCst)
    }

    pub async fn call(&self, to: &str, request: &Request) -> Result<Response> {
        self.transport.call(&self.id, to, request).await
    }

    pub async fn call_with_timeout(
        &self,
        to: &str,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        self.transport
            .call_with_timeout(&self.id, to, request, timeout)
            .await
    }

    /// Run `task` in the background, counted until it completes
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let counter = Arc::clone(&self.background);
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            task.await;
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Background tasks (asynchronous replication, commit fan-out) still running
    pub fn background_tasks(&self) -> usize {
        self.background.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(config: GridConfig) -> NodeContext {
        let (commits, _) = broadcast::channel(16);
        NodeContext::new(
            "n1",
            1,
            Arc::new(config),
            Arc::new(Transport::new(Duration::from_millis(100))),
            commits,
        )
    }

    #[test]
    fn test_unknown_cache() {
        let ctx = node(GridConfig::default().with_cache(CacheConfig::new("a")));
        assert!(ctx.cache("a").is_ok());
        assert_eq!(
            ctx.cache("b").err(),
            Some(Error::UnknownCache("b".into()))
        );
    }

    #[test]
    fn test_check_primary() {
        let ctx = node(GridConfig::default().with_cache(CacheConfig::new("a").partitions(8)));
        let cache = ctx.cache("a").unwrap();
        ctx.apply_topology(&TopologyEvent {
            version: 1,
            nodes: vec!["n1".into()],
            reassignments: vec![],
        });

        assert!(cache.check_primary("n1", 3, 1).is_ok());
        assert!(cache.check_primary("n1", 3, 0).is_ok());
        assert!(matches!(
            cache.check_primary("n1", 3, 2),
            Err(Error::StaleTopology { used: 2, current: 1 })
        ));
        assert!(matches!(
            cache.check_primary("n2", 3, 1),
            Err(Error::StaleTopology { .. })
        ));

        cache.freeze_partition(3).unwrap();
        assert!(matches!(
            cache.check_primary("n1", 3, 1),
            Err(Error::PartitionUnavailable { partition: 3, .. })
        ));
        cache.unfreeze_partition(3).unwrap();
        assert!(cache.check_primary("n1", 3, 1).is_ok());
    }

    #[tokio::test]
    async fn test_background_tasks_counted() {
        let ctx = node(GridConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        ctx.spawn_background(async move {
            let _ = rx.await;
        });
        assert_eq!(ctx.background_tasks(), 1);
        tx.send(()).unwrap();
        for _ in 0..100 {
            if ctx.background_tasks() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.background_tasks(), 0);
    }
}

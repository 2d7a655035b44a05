//! Primary-to-backup replication
//!
//! After a primary applies committed entries it streams them, one batch per
//! (backup, partition), to the backups named by its current partition map.
//! `FULL_SYNC` waits for every backup to acknowledge; the other modes hand
//! the batches to a background task that retries with backoff and gives up
//! with a warning, leaving the backup to be caught up by rebalancing.

use crate::common::{retry_with_backoff, Error, NodeId, PartitionId, Result, WriteSyncMode};
use crate::near::CommitNotification;
use crate::node::context::{CacheContext, NodeContext};
use crate::node::messages::{ReplicateRequest, Request, Response, Rejection};
use crate::store::Entry;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entries bound for one backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationBatch {
    pub backup: NodeId,
    pub partition: PartitionId,
    pub entries: Vec<Entry>,
}

pub struct Replicator {
    node: Arc<NodeContext>,
    cache: Arc<CacheContext>,
}

impl Replicator {
    pub fn new(node: Arc<NodeContext>, cache: Arc<CacheContext>) -> Self {
        Self { node, cache }
    }

    /// Group committed entries by backup and partition
    pub fn plan(&self, committed: &[(PartitionId, Entry)]) -> Vec<ReplicationBatch> {
        let map = self.cache.map();
        let mut batches: BTreeMap<(NodeId, PartitionId), Vec<Entry>> = BTreeMap::new();

        for (partition, entry) in committed {
            let owners = match map.owners(*partition) {
                Ok(owners) => owners,
                Err(e) => {
                    tracing::warn!(
                        "Skipping replication of '{}' in partition {}: {}",
                        entry.key,
                        partition,
                        e
                    );
                    continue;
                }
            };
            for backup in owners.backups() {
                if *backup == self.node.id {
                    continue;
                }
                batches
                    .entry((backup.clone(), *partition))
                    .or_default()
                    .push(entry.clone());
            }
        }

        batches
            .into_iter()
            .map(|((backup, partition), entries)| ReplicationBatch {
                backup,
                partition,
                entries,
            })
            .collect()
    }

    /// Replicate committed entries according to the cache's write-sync mode.
    ///
    /// Only `FULL_SYNC` can fail, with `ReplicationTimeout` naming the first
    /// backup that did not acknowledge.
    pub async fn replicate(&self, committed: Vec<(PartitionId, Entry)>) -> Result<()> {
        let batches = self.plan(&committed);
        if batches.is_empty() {
            return Ok(());
        }

        match self.cache.config().write_sync_mode {
            WriteSyncMode::FullSync => {
                let sends = batches.into_iter().map(|batch| {
                    send_batch(Arc::clone(&self.node), self.cache.name().to_string(), batch)
                });
                for result in join_all(sends).await {
                    if let Err(backup) = result {
                        self.node.metrics.replication_timeouts.inc();
                        return Err(Error::ReplicationTimeout { node: backup });
                    }
                }
                Ok(())
            }
            WriteSyncMode::PrimarySync | WriteSyncMode::FullAsync => {
                for batch in batches {
                    self.spawn_async(batch);
                }
                Ok(())
            }
        }
    }

    fn spawn_async(&self, batch: ReplicationBatch) {
        let node = Arc::clone(&self.node);
        let cache = self.cache.name().to_string();
        let attempts = node.config.max_remap_attempts;
        let backoff = node.config.retry_backoff();

        self.node.spawn_background(async move {
            let backup = batch.backup.clone();
            let result = retry_with_backoff(
                || {
                    let node = Arc::clone(&node);
                    let cache = cache.clone();
                    let batch = batch.clone();
                    async move {
                        send_batch(node, cache, batch)
                            .await
                            .map_err(Error::NodeUnreachable)
                    }
                },
                attempts,
                backoff,
            )
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    "Asynchronous replication to {} failed, leaving catch-up to rebalancing: {}",
                    backup,
                    e
                );
            }
        });
    }
}

/// Send one batch and wait for its acknowledgment. Errors name the backup.
async fn send_batch(
    node: Arc<NodeContext>,
    cache: String,
    batch: ReplicationBatch,
) -> std::result::Result<(), NodeId> {
    if node.is_stopped() {
        return Err(batch.backup);
    }

    let request = Request::Replicate(ReplicateRequest {
        cache,
        partition: batch.partition,
        entries: batch.entries,
    });
    let timeout = node.config.replication_timeout();

    match node.call_with_timeout(&batch.backup, &request, timeout).await {
        Ok(Response::ReplicateAck { acked }) => {
            tracing::trace!("{} acknowledged {} entries", batch.backup, acked.len());
            Ok(())
        }
        Ok(other) => {
            tracing::warn!("Replication to {} refused: {:?}", batch.backup, other);
            Err(batch.backup)
        }
        Err(e) => {
            tracing::debug!("Replication to {} failed: {}", batch.backup, e);
            Err(batch.backup)
        }
    }
}

/// Backup side: apply a batch through the idempotent replicated-write path
pub fn handle_replicate(
    node: &NodeContext,
    cache: &CacheContext,
    request: ReplicateRequest,
) -> Response {
    let mut store = match cache.store(request.partition) {
        Ok(store) => store,
        Err(e) => return Response::Rejected(Rejection::from(e)),
    };

    let mut acked = Vec::with_capacity(request.entries.len());
    let mut applied = 0;
    for entry in request.entries {
        node.versions.observe(entry.version);
        match store.apply_replicated(&entry.key, entry.value, entry.version) {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => return Response::Rejected(Rejection::from(e)),
        }
        acked.push((entry.key, entry.version));
    }
    node.metrics.replicated_entries.add(applied);

    Response::ReplicateAck { acked }
}

/// Tell every near cache in the grid about entries a primary just committed
pub fn publish_commits(node: &NodeContext, cache: &str, committed: &[(PartitionId, Entry)]) {
    for (_, entry) in committed {
        // No subscribers is not an error
        let _ = node.commits.send(CommitNotification {
            cache: cache.to_string(),
            entry: entry.clone(),
        });
    }
}

//! Primary-side transaction handling
//!
//! A primary keeps one `RemoteTx` per transaction that locked or prepared
//! keys here: the keys it holds, the writes buffered by prepare and a
//! deadline for the reaper. Once a transaction commits or rolls back on this
//! node its outcome moves to a bounded record of finished transactions, which
//! turns redelivered lock, prepare, commit and rollback messages into no-ops.

use crate::common::utils::lock;
use crate::common::{Concurrency, Error, PartitionId};
use crate::node::context::{CacheContext, NodeContext};
use crate::node::messages::{
    AtomicUpdateRequest, CommitOutcome, CommitRequest, GetRequest, LockOutcome, LockRequest,
    PrepareOutcome, PrepareRequest, Rejection, Response, RollbackRequest,
};
use crate::replication::{publish_commits, Replicator};
use crate::store::Entry;
use crate::tx::{TxId, Version};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a transaction ended on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedOutcome {
    Committed(Version),
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Prepared,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    partition: PartitionId,
    key: String,
    value: Option<Vec<u8>>,
}

#[derive(Debug)]
struct RemoteTx {
    phase: Phase,
    locked: Vec<String>,
    pending: Vec<PendingWrite>,
    max_version: Version,
    deadline: Instant,
}

impl RemoteTx {
    fn new(deadline: Instant) -> Self {
        Self {
            phase: Phase::Active,
            locked: Vec::new(),
            pending: Vec::new(),
            max_version: Version::ZERO,
            deadline,
        }
    }

    fn extend_deadline(&mut self, deadline: Instant) {
        if deadline > self.deadline {
            self.deadline = deadline;
        }
    }

    fn record_lock(&mut self, key: &str) {
        if !self.locked.iter().any(|k| k == key) {
            self.locked.push(key.to_string());
        }
    }
}

/// Participant-side transactions of one cache on one node
pub struct TxTable {
    active: HashMap<TxId, RemoteTx>,
    finished: HashMap<TxId, FinishedOutcome>,
    finished_order: VecDeque<TxId>,
    capacity: usize,
}

impl TxTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn outcome(&self, tx_id: TxId) -> Option<FinishedOutcome> {
        self.finished.get(&tx_id).copied()
    }

    pub fn is_active(&self, tx_id: TxId) -> bool {
        self.active.contains_key(&tx_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn finish(&mut self, tx_id: TxId, outcome: FinishedOutcome) {
        if self.finished.insert(tx_id, outcome).is_none() {
            self.finished_order.push_back(tx_id);
        }
        while self.finished_order.len() > self.capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

fn rejected(e: Error) -> Response {
    Response::Rejected(Rejection::from(e))
}

fn lock_ack(tx_id: TxId, outcome: LockOutcome) -> Response {
    Response::LockAck { tx_id, outcome }
}

fn prepare_ack(tx_id: TxId, outcome: PrepareOutcome) -> Response {
    Response::PrepareAck { tx_id, outcome }
}

fn commit_ack(tx_id: TxId, outcome: CommitOutcome) -> Response {
    Response::CommitAck { tx_id, outcome }
}

/// Committed read of one key
pub fn handle_get(node: &NodeContext, cache: &CacheContext, request: GetRequest) -> Response {
    if let Err(e) = cache.check_primary(&node.id, request.partition, request.topology_version) {
        return rejected(e);
    }
    match cache.store(request.partition) {
        Ok(store) => Response::Read(
            store
                .entry(&request.key)
                .cloned()
                .unwrap_or_else(|| Entry::new(request.key.clone(), None, Version::ZERO)),
        ),
        Err(e) => rejected(e),
    }
}

/// Acquire locks on keys of one partition, in request order, suspending on
/// each held key until it is handed over or the deadline passes.
pub async fn handle_lock(node: &NodeContext, cache: &CacheContext, request: LockRequest) -> Response {
    let tx_id = request.tx_id;
    if let Err(e) = cache.check_primary(&node.id, request.partition, request.topology_version) {
        return rejected(e);
    }

    let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
    {
        let mut txs = lock(&cache.txs);
        if txs.outcome(tx_id).is_some() {
            return lock_ack(tx_id, LockOutcome::RolledBack);
        }
        txs.active
            .entry(tx_id)
            .or_insert_with(|| RemoteTx::new(deadline))
            .extend_deadline(deadline);
    }

    for key in &request.keys {
        if request.no_wait {
            if !cache.locks.try_acquire(tx_id, key) {
                return lock_ack(tx_id, LockOutcome::Busy { key: key.clone() });
            }
        } else if let Err(e) = cache.locks.acquire(tx_id, key, deadline).await {
            tracing::debug!("Lock on '{}' not granted to {}: {}", key, tx_id, e);
            return lock_ack(tx_id, LockOutcome::Timeout { key: key.clone() });
        }

        let mut txs = lock(&cache.txs);
        match txs.active.get_mut(&tx_id) {
            Some(tx) => tx.record_lock(key),
            None => {
                // Rolled back while waiting; the grant raced the rollback
                cache.locks.release(tx_id, key);
                return lock_ack(tx_id, LockOutcome::RolledBack);
            }
        }
    }

    match cache.store(request.partition) {
        Ok(store) => {
            let entries = request
                .keys
                .iter()
                .map(|key| {
                    store
                        .entry(key)
                        .cloned()
                        .unwrap_or_else(|| Entry::new(key.clone(), None, Version::ZERO))
                })
                .collect();
            lock_ack(tx_id, LockOutcome::Granted { entries })
        }
        Err(e) => rejected(e),
    }
}

/// Validate and buffer a transaction's writes for the partitions this node leads.
///
/// Pessimistic transactions must already hold every listed key. Optimistic
/// transactions take the locks now, without waiting, and every observed
/// version is checked against the store: a held lock or a moved version is a
/// conflict.
pub fn handle_prepare(node: &NodeContext, cache: &CacheContext, request: PrepareRequest) -> Response {
    let tx_id = request.tx_id;
    let mut txs = lock(&cache.txs);

    match txs.outcome(tx_id) {
        Some(FinishedOutcome::Committed(version)) => {
            return prepare_ack(
                tx_id,
                PrepareOutcome::Ok {
                    max_version: version,
                },
            )
        }
        Some(FinishedOutcome::RolledBack) => {
            return prepare_ack(tx_id, PrepareOutcome::RolledBack)
        }
        None => {}
    }
    if let Some(tx) = txs.active.get(&tx_id) {
        if tx.phase == Phase::Prepared {
            return prepare_ack(
                tx_id,
                PrepareOutcome::Ok {
                    max_version: tx.max_version,
                },
            );
        }
    }

    for partition in &request.partitions {
        if let Err(e) =
            cache.check_primary(&node.id, partition.partition, request.topology_version)
        {
            return rejected(e);
        }
    }

    let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
    let tx = txs
        .active
        .entry(tx_id)
        .or_insert_with(|| RemoteTx::new(deadline));
    tx.extend_deadline(deadline);

    for partition in &request.partitions {
        for key in &partition.keys {
            match request.concurrency {
                Concurrency::Pessimistic => {
                    if !cache.locks.is_held_by(key, tx_id) {
                        tracing::warn!("{} lost its lock on '{}' before prepare", tx_id, key);
                        return prepare_ack(tx_id, PrepareOutcome::LockLost { key: key.clone() });
                    }
                }
                Concurrency::Optimistic => {
                    if !cache.locks.try_acquire(tx_id, key) {
                        return prepare_ack(tx_id, PrepareOutcome::Conflict { key: key.clone() });
                    }
                    tx.record_lock(key);
                }
            }
        }
    }

    let mut max_version = Version::ZERO;
    let mut pending = Vec::new();
    for partition in &request.partitions {
        let store = match cache.store(partition.partition) {
            Ok(store) => store,
            Err(e) => return rejected(e),
        };

        for check in &partition.checks {
            let current = store.version_of(&check.key);
            if current != check.version {
                tracing::debug!(
                    "{} read '{}' at {} but it is now {}",
                    tx_id,
                    check.key,
                    check.version,
                    current
                );
                return prepare_ack(
                    tx_id,
                    PrepareOutcome::Conflict {
                        key: check.key.clone(),
                    },
                );
            }
        }

        for key in &partition.keys {
            max_version = max_version.max(store.version_of(key));
        }
        for write in &partition.writes {
            max_version = max_version.max(store.version_of(&write.key));
            pending.push(PendingWrite {
                partition: partition.partition,
                key: write.key.clone(),
                value: write.value.clone(),
            });
        }
    }

    tx.pending = pending;
    tx.max_version = max_version;
    tx.phase = Phase::Prepared;
    prepare_ack(tx_id, PrepareOutcome::Ok { max_version })
}

/// Apply the prepared writes at the commit version, release the locks and
/// replicate per the cache's write-sync mode.
pub async fn handle_commit(
    node: &Arc<NodeContext>,
    cache: &Arc<CacheContext>,
    request: CommitRequest,
) -> Response {
    let tx_id = request.tx_id;
    let version = request.commit_version;
    node.versions.observe(version);

    let (committed, failures) = {
        let mut txs = lock(&cache.txs);
        match txs.outcome(tx_id) {
            Some(FinishedOutcome::Committed(_)) => return commit_ack(tx_id, CommitOutcome::Ok),
            Some(FinishedOutcome::RolledBack) => {
                return commit_ack(tx_id, CommitOutcome::RolledBack)
            }
            None => {}
        }

        let Some(tx) = txs.active.remove(&tx_id) else {
            return commit_ack(
                tx_id,
                CommitOutcome::Unknown {
                    reason: format!("{} is not known on {}", tx_id, node.id),
                },
            );
        };
        if tx.phase != Phase::Prepared {
            cache.locks.release_all(tx_id, &tx.locked);
            txs.finish(tx_id, FinishedOutcome::RolledBack);
            return commit_ack(
                tx_id,
                CommitOutcome::Unknown {
                    reason: format!("{} committed before prepare on {}", tx_id, node.id),
                },
            );
        }

        let mut committed = Vec::with_capacity(tx.pending.len());
        let mut failures = Vec::new();
        for write in tx.pending {
            let applied = cache.store(write.partition).and_then(|mut store| match &write.value {
                Some(value) => store.put(&write.key, value.clone(), version),
                None => store.remove(&write.key, version),
            });
            match applied {
                Ok(()) => committed.push((
                    write.partition,
                    Entry::new(write.key, write.value, version),
                )),
                Err(e) => failures.push(format!("{}: {}", write.key, e)),
            }
        }

        cache.locks.release_all(tx_id, &tx.locked);
        txs.finish(tx_id, FinishedOutcome::Committed(version));
        (committed, failures)
    };

    publish_commits(node, cache.name(), &committed);

    let replicated = Replicator::new(Arc::clone(node), Arc::clone(cache))
        .replicate(committed)
        .await;

    if !failures.is_empty() {
        tracing::error!("{} applied partially on {}: {}", tx_id, node.id, failures.join("; "));
        return commit_ack(
            tx_id,
            CommitOutcome::Unknown {
                reason: failures.join("; "),
            },
        );
    }

    match replicated {
        Ok(()) => commit_ack(tx_id, CommitOutcome::Ok),
        Err(Error::ReplicationTimeout { node: backup }) => {
            commit_ack(tx_id, CommitOutcome::ReplicationTimeout { node: backup })
        }
        Err(e) => commit_ack(
            tx_id,
            CommitOutcome::Unknown {
                reason: e.to_string(),
            },
        ),
    }
}

/// Discard buffered writes and release every lock the transaction holds or waits for
pub fn handle_rollback(node: &NodeContext, cache: &CacheContext, request: RollbackRequest) -> Response {
    let tx_id = request.tx_id;
    let mut txs = lock(&cache.txs);

    match txs.active.remove(&tx_id) {
        Some(tx) => {
            cache.locks.release_all(tx_id, &tx.locked);
            tracing::debug!(
                "Rolled back {} on {} ({} locks released)",
                tx_id,
                node.id,
                tx.locked.len()
            );
        }
        None => cache.locks.release_all(tx_id, std::iter::empty()),
    }
    if txs.outcome(tx_id).is_none() {
        txs.finish(tx_id, FinishedOutcome::RolledBack);
    }

    Response::RollbackAck { tx_id }
}

/// Single-key update on an ATOMIC cache: the primary versions the write itself
pub async fn handle_atomic_update(
    node: &Arc<NodeContext>,
    cache: &Arc<CacheContext>,
    request: AtomicUpdateRequest,
) -> Response {
    if cache.config().is_transactional() {
        return rejected(Error::Internal(format!(
            "cache '{}' is TRANSACTIONAL; atomic updates are not accepted",
            cache.name()
        )));
    }
    if let Err(e) = cache.check_primary(&node.id, request.partition, request.topology_version) {
        return rejected(e);
    }

    let entry = {
        let mut store = match cache.store(request.partition) {
            Ok(store) => store,
            Err(e) => return rejected(e),
        };
        node.versions.observe(store.version_of(&request.key));
        let version = node.versions.next();
        let applied = match &request.value {
            Some(value) => store.put(&request.key, value.clone(), version),
            None => store.remove(&request.key, version),
        };
        if let Err(e) = applied {
            return rejected(e);
        }
        Entry::new(request.key, request.value, version)
    };

    let version = entry.version;
    let committed = vec![(request.partition, entry)];
    publish_commits(node, cache.name(), &committed);

    let outcome = match Replicator::new(Arc::clone(node), Arc::clone(cache))
        .replicate(committed)
        .await
    {
        Ok(()) => CommitOutcome::Ok,
        Err(Error::ReplicationTimeout { node: backup }) => {
            CommitOutcome::ReplicationTimeout { node: backup }
        }
        Err(e) => CommitOutcome::Unknown {
            reason: e.to_string(),
        },
    };
    Response::AtomicAck { version, outcome }
}

/// Roll back every participant-side transaction whose deadline plus `grace`
/// has passed. Returns how many were reaped.
///
/// Prepared transactions are left alone: the coordinator may already have
/// decided to commit, so they keep their locks until commit or rollback
/// arrives.
pub fn reap_expired(node: &NodeContext, cache: &CacheContext, now: Instant, grace: Duration) -> usize {
    let mut txs = lock(&cache.txs);
    let expired: Vec<TxId> = txs
        .active
        .iter()
        .filter(|(_, tx)| tx.phase == Phase::Active && tx.deadline + grace <= now)
        .map(|(tx_id, _)| *tx_id)
        .collect();

    for tx_id in &expired {
        if let Some(tx) = txs.active.remove(tx_id) {
            cache.locks.release_all(*tx_id, &tx.locked);
            txs.finish(*tx_id, FinishedOutcome::RolledBack);
            tracing::warn!(
                "Reaped expired {} on {} in cache '{}' ({} locks released)",
                tx_id,
                node.id,
                cache.name(),
                tx.locked.len()
            );
        }
    }

    node.metrics.reaped_transactions.add(expired.len() as u64);
    expired.len()
}

//! Coordinator-side protocol
//!
//! `TxCoordinator` talks to the primaries of one cache on behalf of the
//! transactions started on its node. Lock requests go out one partition at a
//! time, in canonical order. Prepare, commit and rollback fan out to every
//! participant concurrently and suspend only until all replies for the phase
//! are in (or the deadline passes).

use crate::affinity::Owners;
use crate::common::{
    retry_with_backoff, CacheConfig, Concurrency, Error, NodeId, PartitionId, Result,
};
use crate::node::context::{CacheContext, NodeContext};
use crate::node::messages::{
    AtomicUpdateRequest, CommitOutcome, CommitRequest, GetRequest, LockOutcome, LockRequest,
    PartitionWrites, PrepareOutcome, PrepareRequest, Request, Response, RollbackRequest,
};
use crate::store::Entry;
use crate::tx::{TxId, Version};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Extra time a lock request is given past the transaction deadline, so the
/// primary's own timeout reply arrives before the caller gives up.
const LOCK_REPLY_MARGIN: Duration = Duration::from_millis(100);

/// Locks granted on one partition
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub primary: NodeId,
    pub entries: Vec<Entry>,
}

/// Result of one prepare round
#[derive(Debug)]
pub struct PrepareRound {
    /// Every primary a prepare was sent to, whether or not it succeeded
    pub participants: Vec<NodeId>,
    /// Highest entry version reported by the participants
    pub result: Result<Version>,
}

#[derive(Clone)]
pub struct TxCoordinator {
    node: Arc<NodeContext>,
    cache: Arc<CacheContext>,
}

impl TxCoordinator {
    pub fn new(node: Arc<NodeContext>, cache: Arc<CacheContext>) -> Self {
        Self { node, cache }
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    pub fn cache(&self) -> &Arc<CacheContext> {
        &self.cache
    }

    pub fn config(&self) -> &CacheConfig {
        self.cache.config()
    }

    pub fn partition_of(&self, key: &str) -> PartitionId {
        self.cache.map().partition_of(key)
    }

    pub fn owners(&self, partition: PartitionId) -> Result<Owners> {
        self.cache.map().owners(partition)
    }

    async fn call(&self, to: &str, request: &Request, deadline: Instant) -> Result<Response> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TxTimeout(format!(
                "deadline passed before {} to {}",
                request.name(),
                to
            )));
        }
        let timeout = remaining.min(self.node.transport.rpc_timeout());
        self.node.call_with_timeout(to, request, timeout).await
    }

    /// Committed read from the key's primary, remapping on stale topology
    pub async fn read(&self, key: &str, deadline: Instant) -> Result<Entry> {
        retry_with_backoff(
            || self.read_once(key, deadline),
            self.node.config.max_remap_attempts + 1,
            self.node.config.retry_backoff(),
        )
        .await
    }

    async fn read_once(&self, key: &str, deadline: Instant) -> Result<Entry> {
        let owners = self.cache.map().owners_of_key(key)?;
        let request = Request::Get(GetRequest {
            cache: self.cache.name().to_string(),
            topology_version: owners.topology_version,
            partition: owners.partition,
            key: key.to_string(),
        });

        match self.call(owners.primary(), &request, deadline).await? {
            Response::Read(entry) => Ok(entry),
            other => Err(self.remap_error(other.unexpected(self.cache.name(), "read"))),
        }
    }

    fn remap_error(&self, e: Error) -> Error {
        if matches!(e, Error::StaleTopology { .. }) {
            self.node.metrics.stale_topology_remaps.inc();
        }
        e
    }

    /// Acquire locks on `keys` (already in canonical order) in one partition.
    ///
    /// Suspends until the primary grants every key or the deadline passes.
    /// With `no_wait` a key held by another transaction fails the call at
    /// once with `LockOrderViolation`.
    pub async fn lock(
        &self,
        tx_id: TxId,
        owners: &Owners,
        keys: Vec<String>,
        no_wait: bool,
        deadline: Instant,
    ) -> Result<LockGrant> {
        let primary = owners.primary().clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TxTimeout(tx_id.to_string()));
        }

        let first_key = keys.first().cloned().unwrap_or_default();
        let request = Request::Lock(LockRequest {
            cache: self.cache.name().to_string(),
            tx_id,
            topology_version: owners.topology_version,
            partition: owners.partition,
            keys,
            timeout_ms: remaining.as_millis() as u64,
            no_wait,
        });

        let response = match self
            .node
            .call_with_timeout(&primary, &request, remaining + LOCK_REPLY_MARGIN)
            .await
        {
            Ok(response) => response,
            Err(Error::Timeout(_)) => {
                return Err(Error::LockTimeout {
                    tx_id: tx_id.to_string(),
                    key: first_key,
                })
            }
            Err(e) => return Err(e),
        };

        match response {
            Response::LockAck {
                outcome: LockOutcome::Granted { entries },
                ..
            } => Ok(LockGrant { primary, entries }),
            Response::LockAck {
                outcome: LockOutcome::Timeout { key },
                ..
            } => {
                tracing::debug!("{} timed out waiting for '{}' on {}", tx_id, key, primary);
                Err(Error::LockTimeout {
                    tx_id: tx_id.to_string(),
                    key,
                })
            }
            Response::LockAck {
                outcome: LockOutcome::Busy { key },
                ..
            } => Err(Error::LockOrderViolation {
                tx_id: tx_id.to_string(),
                key,
            }),
            Response::LockAck {
                outcome: LockOutcome::RolledBack,
                ..
            } => Err(Error::InvalidTxState {
                tx_id: tx_id.to_string(),
                state: "ROLLED_BACK".into(),
                reason: format!("rolled back on {}", primary),
            }),
            other => Err(self.remap_error(other.unexpected(self.cache.name(), "lock"))),
        }
    }

    /// Send prepare to the primary of every partition in `plan`, concurrently.
    pub async fn prepare(
        &self,
        tx_id: TxId,
        concurrency: Concurrency,
        plan: Vec<PartitionWrites>,
        deadline: Instant,
    ) -> PrepareRound {
        let mut by_primary: BTreeMap<NodeId, Vec<PartitionWrites>> = BTreeMap::new();
        let topology_version;
        {
            let map = self.cache.map();
            topology_version = map.version();
            for writes in plan {
                match map.owners(writes.partition) {
                    Ok(owners) => by_primary
                        .entry(owners.primary().clone())
                        .or_default()
                        .push(writes),
                    Err(e) => {
                        return PrepareRound {
                            participants: Vec::new(),
                            result: Err(e),
                        }
                    }
                }
            }
        }

        let timeout_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        let participants: Vec<NodeId> = by_primary.keys().cloned().collect();
        let calls = by_primary.into_iter().map(|(primary, partitions)| {
            let request = Request::Prepare(PrepareRequest {
                cache: self.cache.name().to_string(),
                tx_id,
                topology_version,
                concurrency,
                timeout_ms,
                partitions,
            });
            async move {
                let reply = self.call(&primary, &request, deadline).await;
                (primary, reply)
            }
        });

        let mut max_version = Version::ZERO;
        let mut failures = Vec::new();
        for (primary, reply) in join_all(calls).await {
            match self.prepare_reply(tx_id, &primary, reply, deadline) {
                Ok(version) => max_version = max_version.max(version),
                Err(e) => failures.push(e),
            }
        }

        // A definite failure outranks one that a remap could fix
        let failure = match failures.iter().position(|e| !e.is_retryable()) {
            Some(i) => Some(failures.swap_remove(i)),
            None => failures.into_iter().next(),
        };

        PrepareRound {
            participants,
            result: match failure {
                Some(e) => Err(e),
                None => Ok(max_version),
            },
        }
    }

    fn prepare_reply(
        &self,
        tx_id: TxId,
        primary: &str,
        reply: Result<Response>,
        deadline: Instant,
    ) -> Result<Version> {
        let response = match reply {
            Ok(response) => response,
            Err(Error::Timeout(_)) if Instant::now() >= deadline => {
                return Err(Error::TxTimeout(tx_id.to_string()))
            }
            Err(Error::Timeout(reason)) | Err(Error::NodeUnreachable(reason)) => {
                return Err(Error::ParticipantFailure {
                    node: primary.to_string(),
                    reason: format!("no prepare reply: {}", reason),
                })
            }
            Err(e) => return Err(e),
        };

        match response {
            Response::PrepareAck { outcome, .. } => match outcome {
                PrepareOutcome::Ok { max_version } => Ok(max_version),
                PrepareOutcome::Conflict { key } => Err(Error::WriteConflict {
                    tx_id: tx_id.to_string(),
                    key,
                }),
                PrepareOutcome::LockLost { key } => Err(Error::LockTimeout {
                    tx_id: tx_id.to_string(),
                    key,
                }),
                PrepareOutcome::RolledBack => Err(Error::TxTimeout(format!(
                    "{} was rolled back on {} before prepare",
                    tx_id, primary
                ))),
            },
            other => Err(self.remap_error(other.unexpected(self.cache.name(), "prepare"))),
        }
    }

    /// Send commit to every participant concurrently. Redelivery on transient
    /// failures is safe; participants ignore a commit they already applied.
    pub async fn commit(
        &self,
        tx_id: TxId,
        participants: &[NodeId],
        commit_version: Version,
    ) -> Result<()> {
        let calls = participants.iter().map(|participant| {
            let request = Request::Commit(CommitRequest {
                cache: self.cache.name().to_string(),
                tx_id,
                commit_version,
            });
            async move {
                let reply = retry_with_backoff(
                    || self.commit_once(participant, &request),
                    self.node.config.max_remap_attempts,
                    self.node.config.retry_backoff(),
                )
                .await;
                (participant, reply)
            }
        });

        let mut first_failure = None;
        for (participant, reply) in join_all(calls).await {
            let failure = match reply {
                Ok(CommitOutcome::Ok) => continue,
                Ok(CommitOutcome::ReplicationTimeout { node }) => Error::ReplicationTimeout { node },
                Ok(CommitOutcome::RolledBack) => Error::ParticipantFailure {
                    node: participant.clone(),
                    reason: format!("{} rolled back before commit", tx_id),
                },
                Ok(CommitOutcome::Unknown { reason }) => Error::ParticipantFailure {
                    node: participant.clone(),
                    reason,
                },
                Err(e) => Error::ParticipantFailure {
                    node: participant.clone(),
                    reason: e.to_string(),
                },
            };
            tracing::warn!("Commit of {} on {} failed: {}", tx_id, participant, failure);
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn commit_once(&self, participant: &str, request: &Request) -> Result<CommitOutcome> {
        // A FULL_SYNC commit waits on backups before replying
        let timeout = self.node.transport.rpc_timeout() + self.node.config.replication_timeout();
        match self.node.call_with_timeout(participant, request, timeout).await? {
            Response::CommitAck { outcome, .. } => Ok(outcome),
            other => Err(other.unexpected(self.cache.name(), "commit")),
        }
    }

    /// Tell every participant to roll back. Failures are logged; the reaper
    /// on an unreachable participant releases its locks eventually.
    pub async fn rollback(&self, tx_id: TxId, participants: &[NodeId]) {
        let calls = participants.iter().map(|participant| {
            let request = Request::Rollback(RollbackRequest {
                cache: self.cache.name().to_string(),
                tx_id,
            });
            async move {
                let reply = self.node.call(participant, &request).await;
                (participant, reply)
            }
        });

        for (participant, reply) in join_all(calls).await {
            match reply {
                Ok(Response::RollbackAck { .. }) => {}
                Ok(other) => {
                    tracing::warn!("Unexpected rollback reply from {}: {:?}", participant, other)
                }
                Err(e) => tracing::debug!("Rollback of {} on {} failed: {}", tx_id, participant, e),
            }
        }
    }

    /// Update one key on an ATOMIC cache through its primary
    pub async fn atomic_update(&self, key: &str, value: Option<Vec<u8>>) -> Result<Version> {
        retry_with_backoff(
            || self.atomic_update_once(key, value.clone()),
            self.node.config.max_remap_attempts + 1,
            self.node.config.retry_backoff(),
        )
        .await
    }

    async fn atomic_update_once(&self, key: &str, value: Option<Vec<u8>>) -> Result<Version> {
        let owners = self.cache.map().owners_of_key(key)?;
        let request = Request::AtomicUpdate(AtomicUpdateRequest {
            cache: self.cache.name().to_string(),
            topology_version: owners.topology_version,
            partition: owners.partition,
            key: key.to_string(),
            value,
        });
        let timeout = self.node.transport.rpc_timeout() + self.node.config.replication_timeout();

        match self
            .node
            .call_with_timeout(owners.primary(), &request, timeout)
            .await?
        {
            Response::AtomicAck { version, outcome } => match outcome {
                CommitOutcome::Ok => Ok(version),
                CommitOutcome::ReplicationTimeout { node } => Err(Error::ReplicationTimeout { node }),
                other => Err(Error::ParticipantFailure {
                    node: owners.primary().clone(),
                    reason: format!("{:?}", other),
                }),
            },
            other => Err(self.remap_error(other.unexpected(self.cache.name(), "atomic update"))),
        }
    }
}

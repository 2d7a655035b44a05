//! Node-to-node messages
//!
//! Every request carries the cache name; transactional requests also carry
//! the transaction id so that redelivery can be detected, and mapped requests
//! carry the topology version the sender used.

use crate::common::{Concurrency, Error, NodeId, PartitionId};
use crate::store::Entry;
use crate::tx::{TxId, Version};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get(GetRequest),
    Lock(LockRequest),
    Prepare(PrepareRequest),
    Commit(CommitRequest),
    Rollback(RollbackRequest),
    Replicate(ReplicateRequest),
    AtomicUpdate(AtomicUpdateRequest),
}

impl Request {
    pub fn cache(&self) -> &str {
        match self {
            Request::Get(r) => &r.cache,
            Request::Lock(r) => &r.cache,
            Request::Prepare(r) => &r.cache,
            Request::Commit(r) => &r.cache,
            Request::Rollback(r) => &r.cache,
            Request::Replicate(r) => &r.cache,
            Request::AtomicUpdate(r) => &r.cache,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Get(_) => "get",
            Request::Lock(_) => "lock",
            Request::Prepare(_) => "prepare",
            Request::Commit(_) => "commit",
            Request::Rollback(_) => "rollback",
            Request::Replicate(_) => "replicate",
            Request::AtomicUpdate(_) => "atomic_update",
        }
    }
}

/// Committed read from the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub cache: String,
    pub topology_version: u64,
    pub partition: PartitionId,
    pub key: String,
}

/// Acquire locks on keys of one partition, in the given (canonical) order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub cache: String,
    pub tx_id: TxId,
    pub topology_version: u64,
    pub partition: PartitionId,
    pub keys: Vec<String>,
    pub timeout_ms: u64,
    /// Answer `Busy` instead of queueing behind another holder
    pub no_wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOp {
    pub key: String,
    /// `None` removes the key
    pub value: Option<Vec<u8>>,
}

/// Version a transaction observed for a key; prepare fails if it moved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCheck {
    pub key: String,
    pub version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionWrites {
    pub partition: PartitionId,
    pub writes: Vec<WriteOp>,
    pub checks: Vec<ReadCheck>,
    /// Keys the transaction must hold locks on (pessimistic) or lock now (optimistic)
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub cache: String,
    pub tx_id: TxId,
    pub topology_version: u64,
    pub concurrency: Concurrency,
    pub timeout_ms: u64,
    pub partitions: Vec<PartitionWrites>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub cache: String,
    pub tx_id: TxId,
    pub commit_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub cache: String,
    pub tx_id: TxId,
}

/// Committed entries streamed from a primary to one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub cache: String,
    pub partition: PartitionId,
    pub entries: Vec<Entry>,
}

/// Single-key update on an ATOMIC cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicUpdateRequest {
    pub cache: String,
    pub topology_version: u64,
    pub partition: PartitionId,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Committed entry (value `None` if absent or removed)
    Read(Entry),
    LockAck {
        tx_id: TxId,
        outcome: LockOutcome,
    },
    PrepareAck {
        tx_id: TxId,
        outcome: PrepareOutcome,
    },
    CommitAck {
        tx_id: TxId,
        outcome: CommitOutcome,
    },
    RollbackAck {
        tx_id: TxId,
    },
    ReplicateAck {
        acked: Vec<(String, Version)>,
    },
    AtomicAck {
        version: Version,
        outcome: CommitOutcome,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOutcome {
    /// Locks held; current committed entries of the locked keys
    Granted { entries: Vec<Entry> },
    Timeout { key: String },
    /// Held by another transaction; only for `no_wait` requests
    Busy { key: String },
    /// The transaction was already rolled back on this node
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareOutcome {
    /// Writes buffered; highest version among the touched entries
    Ok { max_version: Version },
    Conflict { key: String },
    /// A pessimistic lock the transaction should hold is gone
    LockLost { key: String },
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Ok,
    ReplicationTimeout { node: NodeId },
    RolledBack,
    /// Nothing prepared for this transaction here, or the apply failed
    Unknown { reason: String },
}

/// Request refused before any transactional processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    StaleTopology { used: u64, current: u64 },
    PartitionUnavailable { partition: PartitionId },
    UnknownCache(String),
    Internal(String),
}

impl Rejection {
    pub fn into_error(self, cache: &str) -> Error {
        match self {
            Rejection::StaleTopology { used, current } => Error::StaleTopology { used, current },
            Rejection::PartitionUnavailable { partition } => Error::PartitionUnavailable {
                cache: cache.to_string(),
                partition,
            },
            Rejection::UnknownCache(name) => Error::UnknownCache(name),
            Rejection::Internal(reason) => Error::Internal(reason),
        }
    }
}

impl From<Error> for Rejection {
    fn from(e: Error) -> Self {
        match e {
            Error::StaleTopology { used, current } => Rejection::StaleTopology { used, current },
            Error::PartitionUnavailable { partition, .. } => {
                Rejection::PartitionUnavailable { partition }
            }
            Error::UnknownCache(name) => Rejection::UnknownCache(name),
            other => Rejection::Internal(other.to_string()),
        }
    }
}

impl Response {
    /// Error for a response that is not the variant the caller expected
    pub fn unexpected(self, cache: &str, expected: &str) -> Error {
        match self {
            Response::Rejected(rejection) => rejection.into_error(cache),
            other => Error::Internal(format!("expected {} response, got {:?}", expected, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_round_trips_through_error() {
        let rejection = Rejection::from(Error::PartitionUnavailable {
            cache: "c".into(),
            partition: 4,
        });
        assert_eq!(rejection, Rejection::PartitionUnavailable { partition: 4 });
        assert!(matches!(
            rejection.into_error("c"),
            Error::PartitionUnavailable { partition: 4, .. }
        ));
    }

    #[test]
    fn test_unexpected_response() {
        let err = Response::RollbackAck { tx_id: TxId::new() }.unexpected("c", "read");
        assert!(matches!(err, Error::Internal(_)));

        let err = Response::Rejected(Rejection::StaleTopology { used: 1, current: 2 })
            .unexpected("c", "read");
        assert_eq!(err, Error::StaleTopology { used: 1, current: 2 });
    }

    #[test]
    fn test_request_metadata() {
        let req = Request::Rollback(RollbackRequest {
            cache: "accounts".into(),
            tx_id: TxId::new(),
        });
        assert_eq!(req.cache(), "accounts");
        assert_eq!(req.name(), "rollback");
    }
}

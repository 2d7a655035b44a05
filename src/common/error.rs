//! Error types for txgrid

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // === Placement Errors ===
    #[error("Partition {partition} of cache '{cache}' is unavailable")]
    PartitionUnavailable { cache: String, partition: u32 },

    #[error("Stale topology: operation mapped at version {used}, current version is {current}")]
    StaleTopology { used: u64, current: u64 },

    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    // === Transaction Errors ===
    #[error("Lock timeout on key '{key}' for transaction {tx_id}")]
    LockTimeout { tx_id: String, key: String },

    #[error("Write conflict on key '{key}' for transaction {tx_id}")]
    WriteConflict { tx_id: String, key: String },

    #[error("Transaction {0} exceeded its timeout")]
    TxTimeout(String),

    #[error("Lock on '{key}' is held elsewhere and was requested out of canonical order by transaction {tx_id}")]
    LockOrderViolation { tx_id: String, key: String },

    #[error("Transaction {tx_id} is {state}: {reason}")]
    InvalidTxState {
        tx_id: String,
        state: String,
        reason: String,
    },

    // === Replication Errors ===
    #[error("Replication to backup {node} timed out")]
    ReplicationTimeout { node: String },

    #[error("Participant {node} failed: {reason}")]
    ParticipantFailure { node: String, reason: String },

    // === Network Errors ===
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corrupted frame: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a condition the engine may retry on its own?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StaleTopology { .. }
                | Error::PartitionUnavailable { .. }
                | Error::NodeUnreachable(_)
                | Error::Timeout(_)
        )
    }

    /// Short machine-readable label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PartitionUnavailable { .. } => "partition_unavailable",
            Error::StaleTopology { .. } => "stale_topology",
            Error::UnknownCache(_) => "unknown_cache",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::WriteConflict { .. } => "write_conflict",
            Error::TxTimeout(_) => "tx_timeout",
            Error::LockOrderViolation { .. } => "lock_order_violation",
            Error::InvalidTxState { .. } => "invalid_tx_state",
            Error::ReplicationTimeout { .. } => "replication_timeout",
            Error::ParticipantFailure { .. } => "participant_failure",
            Error::NodeUnreachable(_) => "node_unreachable",
            Error::Codec(_) => "codec",
            Error::Corrupted(_) => "corrupted",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

//! Transaction identity and the coordinator-side state machine
//!
//! ```text
//! ACTIVE ──► PREPARING ──► PREPARED ──► COMMITTING ──► COMMITTED
//!   │            │             │             │
//!   │            ▼             ▼             └──────► UNKNOWN
//!   └───────► ROLLING_BACK ◄───┘
//!                  │
//!                  ▼
//!             ROLLED_BACK
//! ```
//!
//! `UNKNOWN` is reached only when the commit phase fails after some primary
//! may already have applied the writes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transaction identifier, unique across the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Unknown
        )
    }

    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, RollingBack)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Committed)
                | (Committing, Unknown)
                | (RollingBack, RolledBack)
        )
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxState::Active => "ACTIVE",
            TxState::Preparing => "PREPARING",
            TxState::Prepared => "PREPARED",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RollingBack => "ROLLING_BACK",
            TxState::RolledBack => "ROLLED_BACK",
            TxState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

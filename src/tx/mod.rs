//! Transactions
//!
//! - `transaction`: the client handle (reads, buffered writes, commit)
//! - `coordinator`: lock, prepare, commit and rollback fan-out to primaries
//! - `participant`: the primary-side handlers and the reaper
//! - `version`, `state`: commit ordering and the coordinator state machine

pub mod coordinator;
pub mod participant;
pub mod state;
pub mod transaction;
pub mod version;

pub use coordinator::TxCoordinator;
pub use participant::{FinishedOutcome, TxTable};
pub use state::{TxId, TxState};
pub use transaction::{Transaction, TxOptions};
pub use version::{Version, VersionAuthority};

//! # txgrid
//!
//! A partitioned in-memory key-value grid with:
//! - Multi-key ACID transactions (pessimistic or optimistic, three isolation levels)
//! - Two-phase commit across the primaries of every touched partition
//! - Deadlock-free locking through one canonical lock order
//! - Primary/backup replication with FULL_SYNC, PRIMARY_SYNC or FULL_ASYNC acknowledgment
//! - Optional per-node near caches kept fresh by commit notifications
//!
//! ## Architecture
//!
//! ```text
//!            tx_start / get / put / commit
//!                        │
//!               ┌────────▼────────┐
//!               │  Coordinator    │   (the node the client talks to)
//!               │  lock → prepare │
//!               │  → commit       │
//!               └───┬─────────┬───┘
//!                   │ Lock / Prepare / Commit
//!        ┌──────────▼──┐   ┌──▼──────────┐
//!        │ Primary P1  │   │ Primary P7  │   lock manager + entry store
//!        └──────┬──────┘   └──────┬──────┘
//!               │ Replicate       │ Replicate
//!        ┌──────▼──────┐   ┌──────▼──────┐
//!        │  Backup P1  │   │  Backup P7  │
//!        └─────────────┘   └─────────────┘
//! ```
//!
//! Every node is a peer: it hosts primary and backup partitions of each cache
//! and coordinates the transactions started on it.
//!
//! ## Usage
//!
//! ```no_run
//! use txgrid::{CacheConfig, Cluster, GridConfig, WriteSyncMode};
//!
//! # async fn demo() -> txgrid::Result<()> {
//! let config = GridConfig::default().with_cache(
//!     CacheConfig::new("accounts")
//!         .backups(1)
//!         .write_sync_mode(WriteSyncMode::FullSync),
//! );
//! let cluster = Cluster::start(config, 3).await?;
//! let accounts = cluster.cache("node-1", "accounts")?;
//!
//! let mut tx = accounts.tx_start()?;
//! tx.put("alice", b"90".to_vec()).await?;
//! tx.put("bob", b"110".to_vec()).await?;
//! tx.commit().await?;
//!
//! assert_eq!(accounts.get("bob").await?, Some(b"110".to_vec()));
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod affinity;
pub mod common;
pub mod grid;
pub mod lock;
pub mod near;
pub mod node;
pub mod replication;
pub mod store;
pub mod tx;

// Re-export commonly used types
pub use common::{
    AtomicityMode, CacheConfig, Concurrency, Error, GridConfig, Isolation, NearCacheConfig,
    Result, WriteSyncMode,
};
pub use grid::{Cache, Cluster};
pub use tx::{Transaction, TxId, TxOptions, TxState, Version};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

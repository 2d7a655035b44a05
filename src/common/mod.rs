//! Common utilities and types shared across txgrid

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use self::config::{
    AtomicityMode, CacheConfig, Concurrency, GridConfig, Isolation, NearCacheConfig,
    WriteSyncMode,
};
pub use error::{Error, Result};
pub use hash::{hrw_rank, key_hash, partition_of, select_owners};
pub use metrics::{Counter, Gauge, Histogram, TxMetrics};
pub use utils::{parse_duration, retry_with_backoff, validate_key};

/// Cluster-unique node identifier
pub type NodeId = String;

/// Partition index in `[0, partitions)`
pub type PartitionId = u32;

//! Entry store
//!
//! One `PartitionStore` per partition, kept in an arena indexed by partition
//! id. Ownership is not stored here; it is resolved through the partition map.

pub mod entry;
pub mod partition;

pub use entry::Entry;
pub use partition::{PartitionState, PartitionStore};

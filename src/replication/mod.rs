//! Replication of committed entries from primaries to backups

pub mod replicator;

pub use replicator::{handle_replicate, publish_commits, ReplicationBatch, Replicator};

//! Embedding API
//!
//! `Cluster` starts and controls a set of in-process peer nodes; `Cache` is a
//! handle on one named cache, bound to the node it coordinates from.

pub mod cache;
pub mod cluster;

pub use cache::Cache;
pub use cluster::Cluster;

//! Node runtime
//!
//! Nodes are peers: each one hosts partitions of every cache, coordinates the
//! transactions started on it and answers requests from the others.

pub mod codec;
pub mod context;
pub mod messages;
pub mod server;
pub mod transport;

pub use context::{CacheContext, NodeContext};
pub use messages::{Request, Response};
pub use server::NodeServer;
pub use transport::Transport;

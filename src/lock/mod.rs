//! Lock manager
//!
//! Exclusive per-key locks held on the primary owner of each key, acquired in
//! canonical order.

pub mod manager;
pub mod order;

pub use manager::LockManager;
pub use order::{canonical_order, LockKey};

//! Near cache
//!
//! Node-local read cache over one partitioned cache. Primaries publish every
//! committed write on the node's commit bus; each near cache subscribes and
//! replaces its copy whenever the notification carries a newer version. Reads
//! that miss fall through to the primary and populate the cache.
//!
//! Removals are kept as tombstones so that a slow read-through cannot put
//! back a value older than the removal. If the subscriber lags behind the
//! bus, the whole cache is dropped.

use crate::common::utils::lock;
use crate::store::Entry;
use crate::tx::Version;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A committed write, as published by the primary that applied it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotification {
    pub cache: String,
    pub entry: Entry,
}

#[derive(Default)]
struct NearInner {
    entries: HashMap<String, Entry>,
    /// Insertion order, for FIFO eviction
    order: VecDeque<String>,
}

pub struct NearCache {
    cache: String,
    capacity: usize,
    inner: Mutex<NearInner>,
}

impl NearCache {
    pub fn new(cache: impl Into<String>, capacity: usize) -> Self {
        Self {
            cache: cache.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(NearInner::default()),
        }
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    /// Cached entry; a tombstone means the key is known to be absent
    pub fn get(&self, key: &str) -> Option<Entry> {
        lock(&self.inner).entries.get(key).cloned()
    }

    /// Store `entry` unless a newer version is already cached
    pub fn update(&self, entry: Entry) -> bool {
        let mut inner = lock(&self.inner);
        match inner.entries.get_mut(&entry.key) {
            Some(current) if current.version >= entry.version => false,
            Some(current) => {
                *current = entry;
                true
            }
            None => {
                while inner.entries.len() >= self.capacity {
                    match inner.order.pop_front() {
                        Some(oldest) => {
                            inner.entries.remove(&oldest);
                        }
                        None => break,
                    }
                }
                inner.order.push_back(entry.key.clone());
                inner.entries.insert(entry.key.clone(), entry);
                true
            }
        }
    }

    pub fn version_of(&self, key: &str) -> Option<Version> {
        lock(&self.inner).entries.get(key).map(|e| e.version)
    }

    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow the commit bus until it closes
    pub fn subscribe(
        self: &Arc<Self>,
        mut updates: broadcast::Receiver<CommitNotification>,
    ) -> JoinHandle<()> {
        let near = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(notification) if notification.cache == near.cache => {
                        near.update(notification.entry);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Near cache '{}' lagged by {} notifications, clearing",
                            near.cache,
                            skipped
                        );
                        near.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(key: &str, value: &[u8], order: u64) -> Entry {
        Entry::new(key, Some(value.to_vec()), Version::new(order, 1))
    }

    #[test]
    fn test_update_keeps_newest() {
        let near = NearCache::new("c", 10);
        assert!(near.update(entry("k", b"v2", 2)));
        assert!(!near.update(entry("k", b"v1", 1)));
        assert_eq!(near.get("k").unwrap().value, Some(b"v2".to_vec()));
    }

    #[test]
    fn test_tombstone_blocks_stale_value() {
        let near = NearCache::new("c", 10);
        near.update(Entry::new("k", None, Version::new(5, 1)));
        assert!(!near.update(entry("k", b"old", 4)));
        assert!(near.get("k").unwrap().is_tombstone());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let near = NearCache::new("c", 2);
        near.update(entry("a", b"1", 1));
        near.update(entry("b", b"1", 1));
        near.update(entry("c", b"1", 1));
        assert_eq!(near.len(), 2);
        assert!(near.get("a").is_none());
        assert!(near.get("c").is_some());
    }

    #[tokio::test]
    async fn test_subscription_applies_matching_cache() {
        let (tx, rx) = broadcast::channel(16);
        let near = Arc::new(NearCache::new("c", 10));
        let task = near.subscribe(rx);

        tx.send(CommitNotification {
            cache: "other".into(),
            entry: entry("x", b"1", 1),
        })
        .unwrap();
        tx.send(CommitNotification {
            cache: "c".into(),
            entry: entry("k", b"1", 1),
        })
        .unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(near.get("x").is_none());
        assert_eq!(near.version_of("k"), Some(Version::new(1, 1)));
    }
}

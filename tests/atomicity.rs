//! Multi-key transactions: all-or-nothing commit and rollback

use std::time::Duration;
use txgrid::{CacheConfig, Cluster, Concurrency, Error, GridConfig, Isolation, TxState};

fn config() -> GridConfig {
    GridConfig::default().with_cache(CacheConfig::new("accounts").partitions(32).backups(1))
}

/// Value of `key` on its current primary
fn primary_value(cluster: &Cluster, key: &str) -> Option<Vec<u8>> {
    let owners = cluster.owners("accounts", key).unwrap();
    cluster
        .entry(owners.primary(), "accounts", key)
        .unwrap()
        .and_then(|entry| entry.value)
}

#[tokio::test]
async fn test_commit_applies_every_key() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();
    let keys: Vec<String> = (0..16).map(|i| format!("acct-{}", i)).collect();

    // Keys spread over partitions led by different nodes
    let primaries: std::collections::BTreeSet<String> = keys
        .iter()
        .map(|k| cluster.owners("accounts", k).unwrap().primary().clone())
        .collect();
    assert!(primaries.len() > 1);

    let mut tx = cache.tx_start().unwrap();
    for key in &keys {
        tx.put(key, key.as_bytes().to_vec()).await.unwrap();
    }
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TxState::Committed);

    let version = tx.commit_version().unwrap();
    for key in &keys {
        assert_eq!(primary_value(&cluster, key), Some(key.as_bytes().to_vec()));
        let owners = cluster.owners("accounts", key).unwrap();
        let entry = cluster.entry(owners.primary(), "accounts", key).unwrap().unwrap();
        assert_eq!(entry.version, version);
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_rollback_applies_nothing() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let cache = cluster.cache("node-2", "accounts").unwrap();

    let mut tx = cache.tx_start().unwrap();
    tx.put_all(vec![("a", b"1".to_vec()), ("b", b"2".to_vec()), ("c", b"3".to_vec())])
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TxState::RolledBack);

    for key in ["a", "b", "c"] {
        assert_eq!(primary_value(&cluster, key), None);
    }

    // Locks were released: a second transaction gets them at once
    let mut tx = cache.tx_start().unwrap();
    tx.put("a", b"x".to_vec()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(primary_value(&cluster, "a"), Some(b"x".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_remove_leaves_tombstone() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();
    cache.put("gone", b"v".to_vec()).await.unwrap();

    let mut tx = cache.tx_start().unwrap();
    tx.remove("gone").await.unwrap();
    assert_eq!(tx.get("gone").await.unwrap(), None);
    tx.commit().await.unwrap();

    let owners = cluster.owners("accounts", "gone").unwrap();
    let entry = cluster
        .entry(owners.primary(), "accounts", "gone")
        .unwrap()
        .unwrap();
    assert!(entry.is_tombstone());
    assert_eq!(cache.get("gone").await.unwrap(), None);
    cluster.shutdown();
}

#[tokio::test]
async fn test_reads_see_own_writes() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();
    cache.put("balance", b"10".to_vec()).await.unwrap();

    for concurrency in [Concurrency::Pessimistic, Concurrency::Optimistic] {
        let mut tx = cache
            .tx_start_with(concurrency, Isolation::RepeatableRead, Duration::from_secs(5))
            .unwrap();
        assert_eq!(tx.get("balance").await.unwrap(), Some(b"10".to_vec()));
        tx.put("balance", b"20".to_vec()).await.unwrap();
        assert_eq!(tx.get("balance").await.unwrap(), Some(b"20".to_vec()));
        tx.rollback().await.unwrap();
    }
    assert_eq!(cache.get("balance").await.unwrap(), Some(b"10".to_vec()));
    cluster.shutdown();
}

/// A key in the lowest partition and one in a different, higher partition
fn low_and_high(cluster: &Cluster) -> (String, String) {
    let mut keys: Vec<(u32, String)> = (0..64)
        .map(|i| format!("k{}", i))
        .map(|k| (cluster.owners("accounts", &k).unwrap().partition, k))
        .collect();
    keys.sort();
    let (low_partition, low) = keys.first().cloned().unwrap();
    let high = keys
        .iter()
        .rev()
        .find(|(partition, _)| *partition != low_partition)
        .map(|(_, k)| k.clone())
        .unwrap();
    (low, high)
}

#[tokio::test]
async fn test_descending_puts_take_free_locks() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();
    let (low, high) = low_and_high(&cluster);

    let mut tx = cache.tx_start().unwrap();
    tx.put(&high, b"1".to_vec()).await.unwrap();
    tx.put(&low, b"1".to_vec()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(primary_value(&cluster, &high), Some(b"1".to_vec()));
    assert_eq!(primary_value(&cluster, &low), Some(b"1".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_out_of_order_lock_refused_when_held() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();
    let (low, high) = low_and_high(&cluster);

    let mut holder = cache.tx_start().unwrap();
    holder.put(&low, b"holder".to_vec()).await.unwrap();

    let mut tx = cache
        .tx_start_with(
            Concurrency::Pessimistic,
            Isolation::RepeatableRead,
            Duration::from_secs(5),
        )
        .unwrap();
    tx.put(&high, b"1".to_vec()).await.unwrap();
    let started = std::time::Instant::now();
    let err = tx.put(&low, b"1".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::LockOrderViolation { ref key, .. } if *key == low));
    // Refused without queueing behind the holder
    assert!(started.elapsed() < Duration::from_secs(1));

    // The refused lock does not end the transaction
    assert_eq!(tx.state(), TxState::Active);
    tx.commit().await.unwrap();
    holder.commit().await.unwrap();
    assert_eq!(primary_value(&cluster, &high), Some(b"1".to_vec()));
    assert_eq!(primary_value(&cluster, &low), Some(b"holder".to_vec()));

    // A batch sorts its keys first
    let mut tx = cache.tx_start().unwrap();
    tx.put_all(vec![(high.clone(), b"2".to_vec()), (low.clone(), b"2".to_vec())])
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(primary_value(&cluster, &low), Some(b"2".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_dropped_transaction_releases_locks() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();

    {
        let mut tx = cache.tx_start().unwrap();
        tx.put("held", b"1".to_vec()).await.unwrap();
    }
    cluster.quiesce(Duration::from_secs(5)).await.unwrap();

    let mut tx = cache
        .tx_start_with(
            Concurrency::Pessimistic,
            Isolation::RepeatableRead,
            Duration::from_millis(500),
        )
        .unwrap();
    tx.put("held", b"2".to_vec()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(primary_value(&cluster, "held"), Some(b"2".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_finished_transaction_refuses_work() {
    let cluster = Cluster::start(config(), 1).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();

    let mut tx = cache.tx_start().unwrap();
    tx.put("k", b"v".to_vec()).await.unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(
        tx.put("k", b"w".to_vec()).await,
        Err(Error::InvalidTxState { .. })
    ));
    assert!(matches!(tx.rollback().await, Err(Error::InvalidTxState { .. })));
    cluster.shutdown();
}

#[tokio::test]
async fn test_transaction_timeout_rolls_back() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "accounts").unwrap();

    let mut tx = cache
        .tx_start_with(
            Concurrency::Pessimistic,
            Isolation::RepeatableRead,
            Duration::from_millis(50),
        )
        .unwrap();
    tx.put("slow", b"1".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(tx.commit().await, Err(Error::TxTimeout(_))));
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(primary_value(&cluster, "slow"), None);
    cluster.shutdown();
}

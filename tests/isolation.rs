//! Concurrent transactions: contention, serialization and conflict detection

use std::time::Duration;
use txgrid::{CacheConfig, Cluster, Concurrency, Error, GridConfig, Isolation, TxState};

fn config() -> GridConfig {
    GridConfig::default().with_cache(CacheConfig::new("c").partitions(32).backups(1))
}

#[tokio::test]
async fn test_disjoint_writers_do_not_contend() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let c1 = cluster.cache("node-1", "c").unwrap();
    let c2 = cluster.cache("node-2", "c").unwrap();
    let timeout = Duration::from_millis(300);

    let mut tx1 = c1
        .tx_start_with(Concurrency::Pessimistic, Isolation::RepeatableRead, timeout)
        .unwrap();
    let mut tx2 = c2
        .tx_start_with(Concurrency::Pessimistic, Isolation::RepeatableRead, timeout)
        .unwrap();

    // Both hold their locks at the same time
    tx1.put_all(vec![("a", b"1".to_vec()), ("b", b"1".to_vec())])
        .await
        .unwrap();
    tx2.put_all(vec![("c", b"2".to_vec()), ("d", b"2".to_vec())])
        .await
        .unwrap();

    tx2.commit().await.unwrap();
    tx1.commit().await.unwrap();

    let all = c1.get_all(&["a", "b", "c", "d"]).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all["a"], b"1");
    assert_eq!(all["d"], b"2");
    cluster.shutdown();
}

#[tokio::test]
async fn test_pessimistic_writers_serialize() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let c1 = cluster.cache("node-1", "c").unwrap();
    let c2 = cluster.cache("node-2", "c").unwrap();

    let mut tx1 = c1.tx_start().unwrap();
    tx1.put("shared", b"first".to_vec()).await.unwrap();

    let second = tokio::spawn(async move {
        let mut tx2 = c2.tx_start().unwrap();
        tx2.put("shared", b"second".to_vec()).await?;
        tx2.commit().await?;
        Ok::<_, Error>(tx2.commit_version())
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished(), "second writer must wait for the lock");

    tx1.commit().await.unwrap();
    let second_version = second.await.unwrap().unwrap().unwrap();
    assert!(second_version > tx1.commit_version().unwrap());

    assert_eq!(c1.get("shared").await.unwrap(), Some(b"second".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_optimistic_stale_read_conflicts() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let c1 = cluster.cache("node-1", "c").unwrap();
    let c2 = cluster.cache("node-3", "c").unwrap();
    c1.put("x", b"0".to_vec()).await.unwrap();

    let timeout = Duration::from_secs(5);
    let mut tx1 = c1
        .tx_start_with(Concurrency::Optimistic, Isolation::Serializable, timeout)
        .unwrap();
    let mut tx2 = c2
        .tx_start_with(Concurrency::Optimistic, Isolation::Serializable, timeout)
        .unwrap();

    assert_eq!(tx1.get("x").await.unwrap(), Some(b"0".to_vec()));
    assert_eq!(tx2.get("x").await.unwrap(), Some(b"0".to_vec()));

    tx1.put("x", b"1".to_vec()).await.unwrap();
    tx2.put("x", b"2".to_vec()).await.unwrap();

    tx1.commit().await.unwrap();
    let err = tx2.commit().await.unwrap_err();
    assert!(matches!(err, Error::WriteConflict { ref key, .. } if key == "x"));
    assert_eq!(tx2.state(), TxState::RolledBack);

    assert_eq!(c2.get("x").await.unwrap(), Some(b"1".to_vec()));

    // The failed prepare left no lock behind
    let mut tx3 = c2
        .tx_start_with(Concurrency::Optimistic, Isolation::Serializable, timeout)
        .unwrap();
    tx3.put("x", b"3".to_vec()).await.unwrap();
    tx3.commit().await.unwrap();
    assert_eq!(c1.get("x").await.unwrap(), Some(b"3".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_repeatable_read_keeps_first_read() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "c").unwrap();
    let other = cluster.cache("node-2", "c").unwrap();
    cache.put("k", b"1".to_vec()).await.unwrap();

    let timeout = Duration::from_secs(5);
    let mut rr = cache
        .tx_start_with(Concurrency::Pessimistic, Isolation::RepeatableRead, timeout)
        .unwrap();
    let mut rc = cache
        .tx_start_with(Concurrency::Pessimistic, Isolation::ReadCommitted, timeout)
        .unwrap();
    assert_eq!(rr.get("k").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(rc.get("k").await.unwrap(), Some(b"1".to_vec()));

    other.put("k", b"2".to_vec()).await.unwrap();

    assert_eq!(rr.get("k").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(rc.get("k").await.unwrap(), Some(b"2".to_vec()));
    rr.commit().await.unwrap();
    rc.commit().await.unwrap();
    cluster.shutdown();
}

#[tokio::test]
async fn test_serializable_read_blocks_writer() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "c").unwrap();
    let other = cluster.cache("node-2", "c").unwrap();
    cache.put("k", b"1".to_vec()).await.unwrap();

    let mut reader = cache
        .tx_start_with(
            Concurrency::Pessimistic,
            Isolation::Serializable,
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reader.get("k").await.unwrap(), Some(b"1".to_vec()));

    let writer = tokio::spawn(async move { other.put("k", b"2".to_vec()).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished(), "writer must wait for the read lock");

    assert_eq!(reader.get("k").await.unwrap(), Some(b"1".to_vec()));
    reader.commit().await.unwrap();

    writer.await.unwrap().unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(b"2".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_lock_wait_times_out() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "c").unwrap();

    let mut holder = cache.tx_start().unwrap();
    holder.put("busy", b"1".to_vec()).await.unwrap();

    let mut waiter = cache
        .tx_start_with(
            Concurrency::Pessimistic,
            Isolation::RepeatableRead,
            Duration::from_millis(200),
        )
        .unwrap();
    let err = waiter.put("busy", b"2".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert_eq!(waiter.state(), TxState::RolledBack);

    holder.commit().await.unwrap();
    assert_eq!(cache.get("busy").await.unwrap(), Some(b"1".to_vec()));
    cluster.shutdown();
}

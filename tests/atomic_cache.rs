//! ATOMIC caches: single-key updates versioned by the primary, no transactions

use std::time::Duration;
use txgrid::{AtomicityMode, CacheConfig, Cluster, Error, GridConfig, WriteSyncMode};

fn config() -> GridConfig {
    GridConfig::default()
        .with_cache(
            CacheConfig::new("sessions")
                .partitions(16)
                .backups(1)
                .atomicity_mode(AtomicityMode::Atomic)
                .write_sync_mode(WriteSyncMode::FullSync),
        )
        .with_cache(CacheConfig::new("ledger").partitions(16).backups(1))
}

#[tokio::test]
async fn test_atomic_cache_rejects_transactions() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "sessions").unwrap();
    assert!(matches!(cache.tx_start(), Err(Error::InvalidConfig(_))));
    cluster.shutdown();
}

#[tokio::test]
async fn test_atomic_updates_replicate() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let cache = cluster.cache("node-2", "sessions").unwrap();

    cache.put("s1", b"alice".to_vec()).await.unwrap();
    cache
        .put_all(vec![("s2", b"bob".to_vec()), ("s3", b"carol".to_vec())])
        .await
        .unwrap();
    assert_eq!(cache.get("s1").await.unwrap(), Some(b"alice".to_vec()));

    for key in ["s1", "s2", "s3"] {
        let owners = cluster.owners("sessions", key).unwrap();
        let primary = cluster.entry(owners.primary(), "sessions", key).unwrap();
        let backup = cluster.entry(&owners.backups()[0], "sessions", key).unwrap();
        assert!(primary.is_some());
        assert_eq!(primary, backup);
    }

    let before = cluster
        .entry(
            cluster.owners("sessions", "s1").unwrap().primary(),
            "sessions",
            "s1",
        )
        .unwrap()
        .unwrap();
    cache.remove("s1").await.unwrap();
    assert_eq!(cache.get("s1").await.unwrap(), None);

    let after = cluster
        .entry(
            cluster.owners("sessions", "s1").unwrap().primary(),
            "sessions",
            "s1",
        )
        .unwrap()
        .unwrap();
    assert!(after.is_tombstone());
    assert!(after.version > before.version);
    cluster.shutdown();
}

#[tokio::test]
async fn test_caches_are_independent() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let sessions = cluster.cache("node-1", "sessions").unwrap();
    let ledger = cluster.cache("node-1", "ledger").unwrap();

    sessions.put("k", b"session".to_vec()).await.unwrap();
    let mut tx = ledger.tx_start().unwrap();
    tx.put("k", b"ledger".to_vec()).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(sessions.get("k").await.unwrap(), Some(b"session".to_vec()));
    assert_eq!(ledger.get("k").await.unwrap(), Some(b"ledger".to_vec()));
    cluster.quiesce(Duration::from_secs(5)).await.unwrap();
    cluster.shutdown();
}

#[tokio::test]
async fn test_atomic_update_with_backup_down() {
    let mut cluster = Cluster::start(config(), 2).await.unwrap();
    let key = (0..)
        .map(|i| format!("s{}", i))
        .find(|k| cluster.owners("sessions", k).unwrap().primary() == "node-1")
        .unwrap();
    cluster.crash("node-2").unwrap();

    let cache = cluster.cache("node-1", "sessions").unwrap();
    let err = cache.put(&key, b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::ReplicationTimeout { .. }));
    cluster.shutdown();
}

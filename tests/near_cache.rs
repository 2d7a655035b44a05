//! Near caches serve repeated reads locally and follow commits made anywhere

use std::time::Duration;
use txgrid::near::NearCache;
use txgrid::{CacheConfig, Cluster, GridConfig, NearCacheConfig};

fn config() -> GridConfig {
    GridConfig::default().with_cache(
        CacheConfig::new("c")
            .partitions(16)
            .backups(1)
            .near_cache(NearCacheConfig { capacity: 128 }),
    )
}

async fn eventually_holds(near: &NearCache, key: &str, value: &[u8]) {
    for _ in 0..100 {
        if near.get(key).and_then(|e| e.value).as_deref() == Some(value) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("near cache never saw {}={:?}", key, value);
}

#[tokio::test]
async fn test_repeated_reads_hit_near_cache() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "c").unwrap();
    cache.put("k", b"v".to_vec()).await.unwrap();

    let ctx = cluster.node("node-1").unwrap().cache("c").unwrap();
    let near = ctx.near().unwrap();
    eventually_holds(near, "k", b"v").await;

    let metrics = &cluster.node("node-1").unwrap().metrics;
    let hits = metrics.near_hits.get();
    for _ in 0..5 {
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
    assert_eq!(metrics.near_hits.get(), hits + 5);
    cluster.shutdown();
}

#[tokio::test]
async fn test_remote_commit_refreshes_near_cache() {
    let cluster = Cluster::start(config(), 3).await.unwrap();
    let reader = cluster.cache("node-3", "c").unwrap();
    let writer = cluster.cache("node-1", "c").unwrap();

    writer.put("k", b"1".to_vec()).await.unwrap();
    assert_eq!(reader.get("k").await.unwrap(), Some(b"1".to_vec()));

    let mut tx = writer.tx_start().unwrap();
    tx.put("k", b"2".to_vec()).await.unwrap();
    tx.commit().await.unwrap();

    let ctx = cluster.node("node-3").unwrap().cache("c").unwrap();
    let near = ctx.near().unwrap();
    eventually_holds(near, "k", b"2").await;
    assert_eq!(near.version_of("k"), tx.commit_version());
    assert_eq!(reader.get("k").await.unwrap(), Some(b"2".to_vec()));

    writer.remove("k").await.unwrap();
    for _ in 0..100 {
        if reader.get("k").await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(reader.get("k").await.unwrap(), None);
    cluster.shutdown();
}

#[tokio::test]
async fn test_transactions_read_primaries_not_near_cache() {
    let cluster = Cluster::start(config(), 2).await.unwrap();
    let cache = cluster.cache("node-1", "c").unwrap();
    cache.put("k", b"committed".to_vec()).await.unwrap();

    // Plant a newer-looking local value; only implicit reads see it
    let ctx = cluster.node("node-1").unwrap().cache("c").unwrap();
    let near = ctx.near().unwrap();
    near.update(txgrid::store::Entry::new(
        "k",
        Some(b"local".to_vec()),
        txgrid::Version::new(u64::MAX, 0),
    ));
    assert_eq!(cache.get("k").await.unwrap(), Some(b"local".to_vec()));

    let mut tx = cache.tx_start().unwrap();
    assert_eq!(tx.get("k").await.unwrap(), Some(b"committed".to_vec()));
    tx.commit().await.unwrap();
    cluster.shutdown();
}

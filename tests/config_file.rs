//! Starting a grid from a configuration file

use std::io::Write;
use tempfile::NamedTempFile;
use txgrid::{Cluster, Concurrency, Error, GridConfig, Isolation, WriteSyncMode};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_cluster_from_toml() {
    let file = write_config(
        r#"
rpc_timeout_ms = 800
replication_timeout_ms = 400

[[caches]]
name = "orders"
backups = 1
write_sync_mode = "FULL_SYNC"
concurrency = "OPTIMISTIC"
isolation = "SERIALIZABLE"
partitions = 32

[[caches]]
name = "events"
atomicity_mode = "ATOMIC"
backups = 0
partitions = 8
"#,
    );

    let config = GridConfig::load(file.path()).unwrap();
    let cluster = Cluster::start(config, 2).await.unwrap();

    let orders = cluster.cache("node-1", "orders").unwrap();
    assert_eq!(orders.config().write_sync_mode, WriteSyncMode::FullSync);
    let tx = orders.tx_start().unwrap();
    assert_eq!(tx.concurrency(), Concurrency::Optimistic);
    assert_eq!(tx.isolation(), Isolation::Serializable);
    drop(tx);

    orders.put("o-1", b"pending".to_vec()).await.unwrap();
    for node in &cluster.owners("orders", "o-1").unwrap().nodes {
        let entry = cluster.entry(node, "orders", "o-1").unwrap().unwrap();
        assert_eq!(entry.value, Some(b"pending".to_vec()));
    }

    let events = cluster.cache("node-2", "events").unwrap();
    events.put("e-1", b"created".to_vec()).await.unwrap();
    assert_eq!(cluster.owners("events", "e-1").unwrap().nodes.len(), 1);
    assert_eq!(events.get("e-1").await.unwrap(), Some(b"created".to_vec()));
    cluster.shutdown();
}

#[tokio::test]
async fn test_invalid_file_rejected() {
    let file = write_config(
        r#"
[[caches]]
name = "a"

[[caches]]
name = "a"
"#,
    );
    assert!(matches!(
        GridConfig::load(file.path()),
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_metrics_render_per_node() {
    let file = write_config(
        r#"
[[caches]]
name = "c"
partitions = 8
"#,
    );
    let cluster = Cluster::start(GridConfig::load(file.path()).unwrap(), 2)
        .await
        .unwrap();
    cluster
        .cache("node-1", "c")
        .unwrap()
        .put("k", b"v".to_vec())
        .await
        .unwrap();

    let text = cluster.metrics();
    assert!(text.contains("txgrid_tx_committed_total{node=\"node-1\"} 1"));
    assert!(text.contains("node=\"node-2\""));
    cluster.shutdown();
}

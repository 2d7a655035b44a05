//! Randomized transaction scenario against an in-process grid

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txgrid::common::parse_duration;
use txgrid::{
    Cache, CacheConfig, Cluster, Concurrency, GridConfig, Isolation, TxState, Version,
    WriteSyncMode,
};

#[derive(Parser)]
#[command(name = "txgrid-sim")]
#[command(about = "Run randomized multi-key transactions and verify every replica")]
struct Cli {
    /// Grid configuration file (TOML); caches defined there override the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache the scenario runs against
    #[arg(long, default_value = "sim")]
    cache: String,

    /// Number of nodes
    #[arg(long, default_value = "4")]
    nodes: usize,

    /// Keys are drawn from [0, keys)
    #[arg(long, default_value = "3")]
    keys: usize,

    /// Total number of transactions
    #[arg(long, default_value = "3000")]
    iterations: usize,

    /// Concurrent clients
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Maximum keys touched by one transaction
    #[arg(long, default_value = "3")]
    max_keys: usize,

    #[arg(long, default_value = "1")]
    backups: usize,

    #[arg(long, default_value = "64")]
    partitions: u32,

    #[arg(long, value_enum, default_value = "full-async")]
    sync_mode: SyncModeArg,

    #[arg(long, value_enum, default_value = "pessimistic")]
    concurrency: ConcurrencyArg,

    #[arg(long, value_enum, default_value = "repeatable-read")]
    isolation: IsolationArg,

    /// Transaction timeout (e.g. "500ms", "5s")
    #[arg(long, default_value = "5s")]
    tx_timeout: String,

    /// How long to wait for background replication before verifying
    #[arg(long, default_value = "30s")]
    quiesce_timeout: String,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Print per-node metrics in Prometheus format
    #[arg(long)]
    metrics: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncModeArg {
    FullSync,
    PrimarySync,
    FullAsync,
}

impl From<SyncModeArg> for WriteSyncMode {
    fn from(arg: SyncModeArg) -> Self {
        match arg {
            SyncModeArg::FullSync => WriteSyncMode::FullSync,
            SyncModeArg::PrimarySync => WriteSyncMode::PrimarySync,
            SyncModeArg::FullAsync => WriteSyncMode::FullAsync,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ConcurrencyArg {
    Pessimistic,
    Optimistic,
}

impl From<ConcurrencyArg> for Concurrency {
    fn from(arg: ConcurrencyArg) -> Self {
        match arg {
            ConcurrencyArg::Pessimistic => Concurrency::Pessimistic,
            ConcurrencyArg::Optimistic => Concurrency::Optimistic,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum IsolationArg {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<IsolationArg> for Isolation {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::ReadCommitted => Isolation::ReadCommitted,
            IsolationArg::RepeatableRead => Isolation::RepeatableRead,
            IsolationArg::Serializable => Isolation::Serializable,
        }
    }
}

/// A transaction that reached the commit phase
struct Record {
    version: Version,
    writes: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct WorkerReport {
    records: Vec<Record>,
    committed: usize,
    unknown: usize,
    failures: BTreeMap<&'static str, usize>,
}

#[derive(Serialize)]
struct Summary {
    nodes: usize,
    keys: usize,
    iterations: usize,
    sync_mode: String,
    concurrency: String,
    isolation: String,
    committed: usize,
    unknown: usize,
    failures: BTreeMap<&'static str, usize>,
    replicas_checked: usize,
    mismatches: Vec<String>,
    elapsed_ms: u128,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if cli.keys == 0 || cli.max_keys == 0 || cli.workers == 0 {
        bail!("--keys, --max-keys and --workers must be positive");
    }

    let config = grid_config(&cli)?;
    let quiesce_timeout = parse_duration(&cli.quiesce_timeout)?;
    let cache_config = config
        .cache(&cli.cache)
        .cloned()
        .context("scenario cache missing from configuration")?;

    let started = std::time::Instant::now();
    let cluster = Cluster::start(config, cli.nodes).await?;
    let caches: Vec<Cache> = cluster
        .nodes()
        .iter()
        .map(|node| cluster.cache(node, &cli.cache))
        .collect::<txgrid::Result<_>>()?;

    tracing::info!(
        "Running {} transactions over {} key(s) on {} node(s) ({}, {} {})",
        cli.iterations,
        cli.keys,
        cli.nodes,
        cache_config.write_sync_mode,
        cache_config.concurrency,
        cache_config.isolation
    );

    let mut handles = Vec::with_capacity(cli.workers);
    for worker in 0..cli.workers {
        let share = cli.iterations / cli.workers + usize::from(worker < cli.iterations % cli.workers);
        let caches = caches.clone();
        let rng = StdRng::seed_from_u64(cli.seed.wrapping_add(worker as u64));
        handles.push(tokio::spawn(run_worker(
            worker,
            share,
            caches,
            rng,
            cli.keys,
            cli.max_keys,
        )));
    }

    let mut report = WorkerReport::default();
    for handle in handles {
        let worker = handle.await?;
        report.committed += worker.committed;
        report.unknown += worker.unknown;
        report.records.extend(worker.records);
        for (kind, count) in worker.failures {
            *report.failures.entry(kind).or_default() += count;
        }
    }

    cluster.quiesce(quiesce_timeout).await?;
    let (replicas_checked, mismatches) = verify(&cluster, &cli.cache, cli.keys, &report.records)?;

    let summary = Summary {
        nodes: cli.nodes,
        keys: cli.keys,
        iterations: cli.iterations,
        sync_mode: cache_config.write_sync_mode.to_string(),
        concurrency: cache_config.concurrency.to_string(),
        isolation: cache_config.isolation.to_string(),
        committed: report.committed,
        unknown: report.unknown,
        failures: report.failures,
        replicas_checked,
        mismatches,
        elapsed_ms: started.elapsed().as_millis(),
    };

    if cli.metrics {
        println!("{}", cluster.metrics());
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "committed={} unknown={} failures={:?} replicas_checked={} elapsed={}ms",
            summary.committed,
            summary.unknown,
            summary.failures,
            summary.replicas_checked,
            summary.elapsed_ms
        );
    }
    cluster.shutdown();

    if !summary.mismatches.is_empty() {
        for mismatch in &summary.mismatches {
            tracing::error!("{}", mismatch);
        }
        bail!("{} replica(s) diverged", summary.mismatches.len());
    }
    Ok(())
}

fn grid_config(cli: &Cli) -> anyhow::Result<GridConfig> {
    let mut config = match &cli.config {
        Some(path) => GridConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GridConfig::default(),
    };

    if config.cache(&cli.cache).is_none() {
        let timeout = parse_duration(&cli.tx_timeout)?;
        config = config.with_cache(
            CacheConfig::new(cli.cache.clone())
                .partitions(cli.partitions)
                .backups(cli.backups)
                .write_sync_mode(cli.sync_mode.into())
                .concurrency(cli.concurrency.into())
                .isolation(cli.isolation.into())
                .tx_timeout_ms(timeout.as_millis() as u64),
        );
    }
    config.validate()?;
    Ok(config)
}

fn key_name(k: usize) -> String {
    format!("key-{}", k)
}

async fn run_worker(
    worker: usize,
    iterations: usize,
    caches: Vec<Cache>,
    mut rng: StdRng,
    keys: usize,
    max_keys: usize,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    let domain: Vec<usize> = (0..keys).collect();

    for i in 0..iterations {
        let Some(cache) = caches.choose(&mut rng) else {
            break;
        };
        let touched = rng.gen_range(1..=max_keys.min(keys));
        let writes: Vec<(String, Vec<u8>)> = domain
            .choose_multiple(&mut rng, touched)
            .map(|k| (key_name(*k), format!("{}:{}", worker, i).into_bytes()))
            .collect();

        let mut tx = match cache.tx_start() {
            Ok(tx) => tx,
            Err(e) => {
                *report.failures.entry(e.kind()).or_default() += 1;
                continue;
            }
        };

        let result = match tx.put_all(writes.clone()).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => report.committed += 1,
            Err(e) => {
                tracing::debug!("Worker {} transaction {} failed: {}", worker, i, e);
                *report.failures.entry(e.kind()).or_default() += 1;
                if tx.state() == TxState::Unknown {
                    report.unknown += 1;
                }
            }
        }

        // Unknown outcomes may have applied; they compete on version like commits
        if matches!(tx.state(), TxState::Committed | TxState::Unknown) {
            if let Some(version) = tx.commit_version() {
                report.records.push(Record { version, writes });
            }
        }
    }
    report
}

/// Compare every key on every owner with the highest-versioned writer
fn verify(
    cluster: &Cluster,
    cache: &str,
    keys: usize,
    records: &[Record],
) -> anyhow::Result<(usize, Vec<String>)> {
    let mut expected: BTreeMap<String, (Version, Vec<u8>)> = BTreeMap::new();
    for record in records {
        for (key, value) in &record.writes {
            let newer = expected
                .get(key)
                .map_or(true, |(version, _)| record.version > *version);
            if newer {
                expected.insert(key.clone(), (record.version, value.clone()));
            }
        }
    }

    let mut checked = 0;
    let mut mismatches = Vec::new();
    for k in 0..keys {
        let key = key_name(k);
        let owners = cluster.owners(cache, &key)?;
        for node in &owners.nodes {
            checked += 1;
            let actual = cluster
                .entry(node, cache, &key)?
                .map(|entry| (entry.version, entry.value));
            let wanted = expected
                .get(&key)
                .map(|(version, value)| (*version, Some(value.clone())));
            if actual != wanted {
                mismatches.push(format!(
                    "{} on {}: expected {:?}, found {:?}",
                    key, node, wanted, actual
                ));
            }
        }
    }
    Ok((checked, mismatches))
}

//! Transaction metrics
//!
//! Lock-free counters and a latency histogram per node, rendered in
//! Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-node transaction metrics
#[derive(Debug, Default)]
pub struct TxMetrics {
    pub tx_started: Counter,
    pub tx_committed: Counter,
    pub tx_rolled_back: Counter,
    pub tx_unknown: Counter,
    pub write_conflicts: Counter,
    pub lock_timeouts: Counter,
    pub replication_timeouts: Counter,
    pub stale_topology_remaps: Counter,
    pub replicated_entries: Counter,
    pub reaped_transactions: Counter,
    pub near_hits: Counter,
    pub near_misses: Counter,
    pub active_transactions: Gauge,
    pub commit_latency: Histogram,
}

impl TxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failed transaction by the kind of error that ended it
    pub fn record_failure(&self, err: &crate::Error) {
        match err {
            crate::Error::WriteConflict { .. } => self.write_conflicts.inc(),
            crate::Error::LockTimeout { .. } | crate::Error::TxTimeout(_) => {
                self.lock_timeouts.inc()
            }
            crate::Error::ReplicationTimeout { .. } => self.replication_timeouts.inc(),
            _ => {}
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self, node: &str) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("txgrid_tx_started_total", "Transactions started", &self.tx_started),
            ("txgrid_tx_committed_total", "Transactions committed", &self.tx_committed),
            ("txgrid_tx_rolled_back_total", "Transactions rolled back", &self.tx_rolled_back),
            ("txgrid_tx_unknown_total", "Transactions with a heuristic outcome", &self.tx_unknown),
            ("txgrid_write_conflicts_total", "Optimistic write conflicts", &self.write_conflicts),
            ("txgrid_lock_timeouts_total", "Lock or transaction timeouts", &self.lock_timeouts),
            ("txgrid_replication_timeouts_total", "FULL_SYNC replication timeouts", &self.replication_timeouts),
            ("txgrid_stale_topology_remaps_total", "Remaps after a stale partition map", &self.stale_topology_remaps),
            ("txgrid_replicated_entries_total", "Entries applied from a primary", &self.replicated_entries),
            ("txgrid_reaped_transactions_total", "Participant transactions rolled back by the reaper", &self.reaped_transactions),
            ("txgrid_near_hits_total", "Near cache hits", &self.near_hits),
            ("txgrid_near_misses_total", "Near cache misses", &self.near_misses),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{}{{node=\"{}\"}} {}", name, node, counter.get());
        }

        out.push_str("# HELP txgrid_active_transactions Transactions currently in flight\n");
        out.push_str("# TYPE txgrid_active_transactions gauge\n");
        let _ = writeln!(
            out,
            "txgrid_active_transactions{{node=\"{}\"}} {}",
            node,
            self.active_transactions.get()
        );

        out.push_str("# HELP txgrid_commit_latency_ms Commit latency in milliseconds\n");
        out.push_str("# TYPE txgrid_commit_latency_ms histogram\n");
        for (boundary, count) in self.commit_latency.get_buckets() {
            let le = if boundary.is_infinite() {
                "+Inf".to_string()
            } else {
                boundary.to_string()
            };
            let _ = writeln!(
                out,
                "txgrid_commit_latency_ms_bucket{{node=\"{}\",le=\"{}\"}} {}",
                node, le, count
            );
        }
        let _ = writeln!(
            out,
            "txgrid_commit_latency_ms_sum{{node=\"{}\"}} {}",
            node,
            self.commit_latency.sum()
        );
        let _ = writeln!(
            out,
            "txgrid_commit_latency_ms_count{{node=\"{}\"}} {}",
            node,
            self.commit_latency.count()
        );

        out
    }
}

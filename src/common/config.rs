//! Configuration for txgrid nodes and caches

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node-level configuration, shared by every node of an in-process grid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Timeout for a single request/response exchange between nodes
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// How long a FULL_SYNC primary waits for backup acknowledgments
    #[serde(default = "default_replication_timeout")]
    pub replication_timeout_ms: u64,

    /// Bounded retry budget for locally recoverable conditions
    #[serde(default = "default_max_remap_attempts")]
    pub max_remap_attempts: usize,

    /// Initial backoff between internal retries (doubles on each attempt)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// How often the participant-side reaper scans for expired transactions
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,

    /// Extra time granted past a transaction deadline before the reaper rolls it back
    #[serde(default = "default_reaper_grace")]
    pub reaper_grace_ms: u64,

    /// Number of finished transaction outcomes remembered per cache for redelivery
    #[serde(default = "default_finished_capacity")]
    pub finished_tx_capacity: usize,

    /// Logical caches hosted by the grid
    #[serde(default)]
    pub caches: Vec<CacheConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_rpc_timeout() -> u64 {
    2_000
}
fn default_replication_timeout() -> u64 {
    1_000
}
fn default_max_remap_attempts() -> usize {
    3
}
fn default_retry_backoff() -> u64 {
    10
}
fn default_reaper_interval() -> u64 {
    500
}
fn default_reaper_grace() -> u64 {
    1_000
}
fn default_finished_capacity() -> usize {
    16_384
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout(),
            replication_timeout_ms: default_replication_timeout(),
            max_remap_attempts: default_max_remap_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            reaper_interval_ms: default_reaper_interval(),
            reaper_grace_ms: default_reaper_grace(),
            finished_tx_capacity: default_finished_capacity(),
            caches: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl GridConfig {
    /// Load configuration from a TOML file, with `TXGRID_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()).format(::config::FileFormat::Toml))
            .add_source(::config::Environment::with_prefix("TXGRID").separator("__"))
            .build()?;
        let config: GridConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Add a cache definition (builder style)
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.caches.push(cache);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig("rpc_timeout_ms must be positive".into()));
        }
        if self.replication_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "replication_timeout_ms must be positive".into(),
            ));
        }
        if self.reaper_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "reaper_interval_ms must be positive".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for cache in &self.caches {
            cache.validate()?;
            if !names.insert(cache.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate cache name: {}",
                    cache.name
                )));
            }
        }
        Ok(())
    }

    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn reaper_grace(&self) -> Duration {
        Duration::from_millis(self.reaper_grace_ms)
    }
}

/// Per-cache configuration, fixed at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Logical cache name
    pub name: String,

    #[serde(default = "default_atomicity_mode")]
    pub atomicity_mode: AtomicityMode,

    /// Number of backup copies per partition
    #[serde(default = "default_backups")]
    pub backups: usize,

    #[serde(default = "default_write_sync_mode")]
    pub write_sync_mode: WriteSyncMode,

    /// Isolation used when a transaction does not specify one
    #[serde(default = "default_isolation")]
    pub isolation: Isolation,

    /// Concurrency mode used when a transaction does not specify one
    #[serde(default = "default_concurrency")]
    pub concurrency: Concurrency,

    #[serde(default = "default_tx_timeout")]
    pub tx_timeout_ms: u64,

    /// Number of partitions the key space is split into
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_cache: Option<NearCacheConfig>,
}

fn default_atomicity_mode() -> AtomicityMode {
    AtomicityMode::Transactional
}
fn default_backups() -> usize {
    1
}
fn default_write_sync_mode() -> WriteSyncMode {
    WriteSyncMode::PrimarySync
}
fn default_isolation() -> Isolation {
    Isolation::RepeatableRead
}
fn default_concurrency() -> Concurrency {
    Concurrency::Pessimistic
}
fn default_tx_timeout() -> u64 {
    5_000
}
fn default_partitions() -> u32 {
    1024
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            atomicity_mode: default_atomicity_mode(),
            backups: default_backups(),
            write_sync_mode: default_write_sync_mode(),
            isolation: default_isolation(),
            concurrency: default_concurrency(),
            tx_timeout_ms: default_tx_timeout(),
            partitions: default_partitions(),
            near_cache: None,
        }
    }

    pub fn atomicity_mode(mut self, mode: AtomicityMode) -> Self {
        self.atomicity_mode = mode;
        self
    }

    pub fn backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    pub fn write_sync_mode(mut self, mode: WriteSyncMode) -> Self {
        self.write_sync_mode = mode;
        self
    }

    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn tx_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.tx_timeout_ms = timeout_ms;
        self
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn near_cache(mut self, near: NearCacheConfig) -> Self {
        self.near_cache = Some(near);
        self
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn is_transactional(&self) -> bool {
        self.atomicity_mode == AtomicityMode::Transactional
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("cache name cannot be empty".into()));
        }
        if self.partitions == 0 {
            return Err(Error::InvalidConfig(format!(
                "cache '{}': partitions must be positive",
                self.name
            )));
        }
        if self.tx_timeout_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "cache '{}': tx_timeout_ms must be positive",
                self.name
            )));
        }
        if let Some(near) = &self.near_cache {
            if near.capacity == 0 {
                return Err(Error::InvalidConfig(format!(
                    "cache '{}': near cache capacity must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Near cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearCacheConfig {
    #[serde(default = "default_near_capacity")]
    pub capacity: usize,
}

fn default_near_capacity() -> usize {
    10_000
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_near_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtomicityMode {
    Transactional,
    Atomic,
}

/// When a commit is acknowledged relative to backup replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteSyncMode {
    /// Acknowledged after every backup applied the write
    FullSync,
    /// Acknowledged after the primary applied the write
    PrimarySync,
    /// Acknowledged immediately
    FullAsync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Concurrency {
    Pessimistic,
    Optimistic,
}

impl std::fmt::Display for WriteSyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteSyncMode::FullSync => write!(f, "FULL_SYNC"),
            WriteSyncMode::PrimarySync => write!(f, "PRIMARY_SYNC"),
            WriteSyncMode::FullAsync => write!(f, "FULL_ASYNC"),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Isolation::ReadCommitted => write!(f, "READ_COMMITTED"),
            Isolation::RepeatableRead => write!(f, "REPEATABLE_READ"),
            Isolation::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl std::fmt::Display for Concurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Concurrency::Pessimistic => write!(f, "PESSIMISTIC"),
            Concurrency::Optimistic => write!(f, "OPTIMISTIC"),
        }
    }
}

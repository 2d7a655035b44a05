//! Cache handle
//!
//! Entry point for one named cache as seen from one node. Explicit
//! transactions start with `tx_start`; the plain `get`/`put`/`remove`
//! operations outside a transaction run as single-shot transactions with the
//! cache defaults (or as atomic updates on an ATOMIC cache), retried on
//! conditions a remap can fix.

use crate::common::{
    validate_key, AtomicityMode, CacheConfig, Concurrency, Isolation, Result,
};
use crate::node::context::{CacheContext, NodeContext};
use crate::tx::{Transaction, TxCoordinator, TxOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Cache {
    coordinator: TxCoordinator,
}

impl Cache {
    pub(crate) fn new(node: Arc<NodeContext>, cache: Arc<CacheContext>) -> Self {
        Self {
            coordinator: TxCoordinator::new(node, cache),
        }
    }

    pub fn name(&self) -> &str {
        self.coordinator.cache().name()
    }

    /// Node this handle coordinates from
    pub fn node(&self) -> &str {
        &self.coordinator.node().id
    }

    pub fn config(&self) -> &CacheConfig {
        self.coordinator.config()
    }

    /// Start a transaction with the cache's default concurrency, isolation and timeout
    pub fn tx_start(&self) -> Result<Transaction> {
        let config = self.config();
        self.tx_start_with(config.concurrency, config.isolation, config.tx_timeout())
    }

    pub fn tx_start_with(
        &self,
        concurrency: Concurrency,
        isolation: Isolation,
        timeout: Duration,
    ) -> Result<Transaction> {
        Transaction::begin(
            self.coordinator.clone(),
            TxOptions {
                concurrency,
                isolation,
                timeout,
            },
        )
    }

    fn read_deadline(&self) -> Instant {
        let node = self.coordinator.node();
        let attempts = node.config.max_remap_attempts as u32 + 1;
        Instant::now() + node.config.rpc_timeout() * attempts
    }

    /// Committed value of a key, served from the near cache when present
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let node = self.coordinator.node();
        let near = self.coordinator.cache().near().cloned();

        if let Some(near) = &near {
            if let Some(entry) = near.get(key) {
                node.metrics.near_hits.inc();
                return Ok(entry.value);
            }
            node.metrics.near_misses.inc();
        }

        let entry = self.coordinator.read(key, self.read_deadline()).await?;
        let value = entry.value.clone();
        if let Some(near) = near {
            near.update(entry);
        }
        Ok(value)
    }

    /// Committed values of several keys; absent keys are left out
    pub async fn get_all(&self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut values = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                values.insert(key.to_string(), value);
            }
        }
        Ok(values)
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.write_implicit(vec![(key.to_string(), Some(value.into()))])
            .await
    }

    pub async fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let writes = entries
            .into_iter()
            .map(|(k, v)| (k.into(), Some(v.into())))
            .collect();
        self.write_implicit(writes).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.write_implicit(vec![(key.to_string(), None)]).await
    }

    pub async fn remove_all<K>(&self, keys: impl IntoIterator<Item = K>) -> Result<()>
    where
        K: Into<String>,
    {
        let writes = keys.into_iter().map(|k| (k.into(), None)).collect();
        self.write_implicit(writes).await
    }

    async fn write_implicit(&self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        for (key, _) in &writes {
            validate_key(key)?;
        }

        if self.config().atomicity_mode == AtomicityMode::Atomic {
            for (key, value) in writes {
                self.coordinator.atomic_update(&key, value).await?;
            }
            return Ok(());
        }

        let node = self.coordinator.node();
        let attempts = node.config.max_remap_attempts;
        let mut delay = node.config.retry_backoff();
        let mut attempt = 0;
        loop {
            match self.write_once(writes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    attempt += 1;
                    tracing::debug!(
                        "Retrying implicit write on '{}' after {} (attempt {})",
                        self.name(),
                        e,
                        attempt
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_once(&self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        let mut tx = self.tx_start()?;
        tx.write_all(writes).await?;
        tx.commit().await
    }
}

//! Client transaction handle
//!
//! Writes are buffered locally until commit and are visible to this
//! transaction's own reads. Pessimistic transactions lock a key on its
//! primary before the first write to it (and before the first read under
//! SERIALIZABLE). A transaction waits only for keys that sort above
//! everything it holds; a key below that is taken if free and refused with
//! `LockOrderViolation` if another transaction holds it. Batch operations
//! sort their keys first. Optimistic
//! transactions lock nothing until prepare, where every key they touched is
//! checked against the version they observed.
//!
//! Any failure other than a refused out-of-order lock or an invalid key rolls the
//! transaction back. Dropping an unfinished handle rolls it back in the
//! background.

use super::coordinator::{LockGrant, TxCoordinator};
use crate::common::{
    validate_key, Concurrency, Error, Isolation, NodeId, PartitionId, Result, TxMetrics,
    WriteSyncMode,
};
use crate::lock::{canonical_order, LockKey};
use crate::node::messages::{PartitionWrites, ReadCheck, WriteOp};
use crate::store::Entry;
use crate::tx::{TxId, TxState, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-transaction settings; defaults come from the cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    pub timeout: Duration,
}

pub struct Transaction {
    id: TxId,
    coordinator: TxCoordinator,
    options: TxOptions,
    state: TxState,
    started: Instant,
    deadline: Instant,
    /// Buffered writes; `None` removes the key
    writes: BTreeMap<LockKey, Option<Vec<u8>>>,
    /// Committed entries as first (or, under READ_COMMITTED, last) seen
    observed: HashMap<String, Entry>,
    locked: BTreeSet<LockKey>,
    /// Nodes that may hold locks or prepared state for this transaction
    participants: BTreeSet<NodeId>,
    commit_version: Option<Version>,
}

impl Transaction {
    pub(crate) fn begin(coordinator: TxCoordinator, options: TxOptions) -> Result<Self> {
        if !coordinator.config().is_transactional() {
            return Err(Error::InvalidConfig(format!(
                "cache '{}' is ATOMIC and does not support transactions",
                coordinator.config().name
            )));
        }

        let id = TxId::new();
        let started = Instant::now();
        let metrics = &coordinator.node().metrics;
        metrics.tx_started.inc();
        metrics.active_transactions.inc();
        tracing::debug!(
            "Started {} on {} ({} {}, timeout {:?})",
            id,
            coordinator.node().id,
            options.concurrency,
            options.isolation,
            options.timeout
        );

        Ok(Self {
            id,
            coordinator,
            options,
            state: TxState::Active,
            started,
            deadline: started + options.timeout,
            writes: BTreeMap::new(),
            observed: HashMap::new(),
            locked: BTreeSet::new(),
            participants: BTreeSet::new(),
            commit_version: None,
        })
    }

    /// Current id. An optimistic transaction takes a fresh id when its
    /// prepare is remapped onto a newer topology.
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn concurrency(&self) -> Concurrency {
        self.options.concurrency
    }

    pub fn isolation(&self) -> Isolation {
        self.options.isolation
    }

    /// Version assigned at commit, once the commit phase has started
    pub fn commit_version(&self) -> Option<Version> {
        self.commit_version
    }

    fn metrics(&self) -> &TxMetrics {
        &self.coordinator.node().metrics
    }

    fn lock_key(&self, key: &str) -> LockKey {
        LockKey::new(self.coordinator.partition_of(key), key)
    }

    fn transition(&mut self, next: TxState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "{}: {} -> {}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    fn finish(&mut self, state: TxState) {
        self.transition(state);
        let metrics = &self.coordinator.node().metrics;
        metrics.active_transactions.dec();
        match state {
            TxState::Committed => {
                metrics.tx_committed.inc();
                metrics.commit_latency.observe_duration(self.started.elapsed());
            }
            TxState::RolledBack => metrics.tx_rolled_back.inc(),
            TxState::Unknown => metrics.tx_unknown.inc(),
            _ => {}
        }
    }

    async fn ensure_active(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(Error::InvalidTxState {
                tx_id: self.id.to_string(),
                state: self.state.to_string(),
                reason: "transaction is no longer active".into(),
            });
        }
        if Instant::now() >= self.deadline {
            return Err(self.fail(Error::TxTimeout(self.id.to_string())).await);
        }
        Ok(())
    }

    /// Roll back on any error that leaves the transaction unusable
    async fn fail(&mut self, e: Error) -> Error {
        if matches!(e, Error::LockOrderViolation { .. } | Error::InvalidConfig(_)) {
            return e;
        }
        if matches!(
            self.state,
            TxState::Active | TxState::Preparing | TxState::Prepared
        ) {
            self.abort().await;
        }
        self.metrics().record_failure(&e);
        tracing::debug!("{} failed: {}", self.id, e);
        e
    }

    async fn abort(&mut self) {
        self.transition(TxState::RollingBack);
        let participants: Vec<NodeId> = self.participants.iter().cloned().collect();
        if !participants.is_empty() {
            self.coordinator.rollback(self.id, &participants).await;
        }
        self.finish(TxState::RolledBack);
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_active().await?;
        match self.read_key(key).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Read several keys; absent keys are left out of the result
    pub async fn get_all(&mut self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        self.ensure_active().await?;
        match self.read_keys(keys).await {
            Ok(values) => Ok(values),
            Err(e) => Err(self.fail(e).await),
        }
    }

    pub async fn put(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.write_all(vec![(key.to_string(), Some(value.into()))])
            .await
    }

    pub async fn put_all<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let writes = entries
            .into_iter()
            .map(|(k, v)| (k.into(), Some(v.into())))
            .collect();
        self.write_all(writes).await
    }

    pub async fn remove(&mut self, key: &str) -> Result<()> {
        self.write_all(vec![(key.to_string(), None)]).await
    }

    pub async fn remove_all<K>(&mut self, keys: impl IntoIterator<Item = K>) -> Result<()>
    where
        K: Into<String>,
    {
        let writes = keys.into_iter().map(|k| (k.into(), None)).collect();
        self.write_all(writes).await
    }

    /// Buffer a batch of puts (`Some`) and removes (`None`)
    pub(crate) async fn write_all(
        &mut self,
        writes: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<()> {
        self.ensure_active().await?;
        match self.buffer_writes(writes).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn read_key(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let lock_key = self.lock_key(key);
        if let Some(value) = self.writes.get(&lock_key) {
            return Ok(value.clone());
        }

        if self.locks_reads() {
            self.lock_keys(vec![lock_key.clone()]).await?;
        }
        if let Some(entry) = self.cached_read(&lock_key) {
            return Ok(entry.value.clone());
        }

        let entry = self.coordinator.read(key, self.deadline).await?;
        let value = entry.value.clone();
        self.observed.insert(key.to_string(), entry);
        Ok(value)
    }

    async fn read_keys(&mut self, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        for key in keys {
            validate_key(key)?;
        }
        if self.locks_reads() {
            let pending = keys
                .iter()
                .map(|key| self.lock_key(key))
                .filter(|k| !self.writes.contains_key(k))
                .collect();
            self.lock_keys(pending).await?;
        }

        let mut values = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.read_key(key).await? {
                values.insert(key.to_string(), value);
            }
        }
        Ok(values)
    }

    fn locks_reads(&self) -> bool {
        self.options.concurrency == Concurrency::Pessimistic
            && self.options.isolation == Isolation::Serializable
    }

    /// A locked key cannot change under us; otherwise only REPEATABLE_READ
    /// and SERIALIZABLE keep their first read.
    fn cached_read(&self, key: &LockKey) -> Option<&Entry> {
        if self.locked.contains(key) || self.options.isolation != Isolation::ReadCommitted {
            self.observed.get(&key.key)
        } else {
            None
        }
    }

    async fn buffer_writes(&mut self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        for (key, _) in &writes {
            validate_key(key)?;
        }
        let keys: Vec<LockKey> = writes.iter().map(|(key, _)| self.lock_key(key)).collect();

        match self.options.concurrency {
            Concurrency::Pessimistic => self.lock_keys(keys.clone()).await?,
            Concurrency::Optimistic => {
                for key in &keys {
                    if !self.observed.contains_key(&key.key) && !self.writes.contains_key(key) {
                        let entry = self.coordinator.read(&key.key, self.deadline).await?;
                        self.observed.insert(key.key.clone(), entry);
                    }
                }
            }
        }

        for (key, (_, value)) in keys.into_iter().zip(writes) {
            self.writes.insert(key, value);
        }
        Ok(())
    }

    /// Lock keys on their primaries, one partition at a time in canonical order.
    ///
    /// Keys sorting below one already held are requested without queueing,
    /// so a transaction only ever waits for keys above everything it holds.
    async fn lock_keys(&mut self, keys: Vec<LockKey>) -> Result<()> {
        let pending: Vec<LockKey> = canonical_order(keys)
            .into_iter()
            .filter(|k| !self.locked.contains(k))
            .collect();
        let behind = match self.locked.iter().next_back() {
            Some(last) => pending.partition_point(|k| k < last),
            None => 0,
        };
        let (behind, ahead) = pending.split_at(behind);
        self.lock_batches(behind, true).await?;
        self.lock_batches(ahead, false).await
    }

    async fn lock_batches(&mut self, keys: &[LockKey], no_wait: bool) -> Result<()> {
        let mut start = 0;
        while start < keys.len() {
            let partition = keys[start].partition;
            let end = keys[start..]
                .iter()
                .position(|k| k.partition != partition)
                .map_or(keys.len(), |offset| start + offset);
            let batch = &keys[start..end];

            let grant = self.lock_partition(partition, batch, no_wait).await?;
            self.locked.extend(batch.iter().cloned());
            for entry in grant.entries {
                self.observed.insert(entry.key.clone(), entry);
            }
            start = end;
        }
        Ok(())
    }

    /// Lock one partition's batch, remapping on a topology change as long as
    /// nothing in that partition is held yet
    async fn lock_partition(
        &mut self,
        partition: PartitionId,
        batch: &[LockKey],
        no_wait: bool,
    ) -> Result<LockGrant> {
        let holds_partition = self.locked.iter().any(|k| k.partition == partition);
        let remap_attempts = self.coordinator.node().config.max_remap_attempts;
        let backoff = self.coordinator.node().config.retry_backoff();
        let keys: Vec<String> = batch.iter().map(|k| k.key.clone()).collect();
        let mut attempt = 0;

        loop {
            let result = match self.coordinator.owners(partition) {
                Ok(owners) => {
                    self.participants.insert(owners.primary().clone());
                    self.coordinator
                        .lock(self.id, &owners, keys.clone(), no_wait, self.deadline)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Err(e)
                    if !holds_partition
                        && attempt < remap_attempts
                        && Instant::now() < self.deadline
                        && matches!(
                            e,
                            Error::StaleTopology { .. } | Error::PartitionUnavailable { .. }
                        ) =>
                {
                    attempt += 1;
                    tracing::debug!(
                        "Relocking partition {} for {} after {} (attempt {})",
                        partition,
                        self.id,
                        e,
                        attempt
                    );
                    tokio::time::sleep(backoff * attempt as u32).await;
                }
                other => return other,
            }
        }
    }

    fn prepare_plan(&self) -> Vec<PartitionWrites> {
        fn slot(
            plan: &mut BTreeMap<PartitionId, PartitionWrites>,
            partition: PartitionId,
        ) -> &mut PartitionWrites {
            plan.entry(partition).or_insert_with(|| PartitionWrites {
                partition,
                writes: Vec::new(),
                checks: Vec::new(),
                keys: Vec::new(),
            })
        }

        let mut plan = BTreeMap::new();
        for (key, value) in &self.writes {
            slot(&mut plan, key.partition).writes.push(WriteOp {
                key: key.key.clone(),
                value: value.clone(),
            });
        }

        match self.options.concurrency {
            Concurrency::Pessimistic => {
                for key in &self.locked {
                    slot(&mut plan, key.partition).keys.push(key.key.clone());
                }
            }
            Concurrency::Optimistic => {
                let touched: BTreeSet<LockKey> = self
                    .writes
                    .keys()
                    .cloned()
                    .chain(self.observed.keys().map(|key| self.lock_key(key)))
                    .collect();
                for key in touched {
                    let writes = slot(&mut plan, key.partition);
                    if let Some(entry) = self.observed.get(&key.key) {
                        writes.checks.push(ReadCheck {
                            key: key.key.clone(),
                            version: entry.version,
                        });
                    }
                    writes.keys.push(key.key);
                }
            }
        }

        plan.into_values().collect()
    }

    /// Two-phase commit across the primaries of every touched partition
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_active().await?;

        let read_only = self.writes.is_empty()
            && (self.options.concurrency == Concurrency::Pessimistic || self.observed.is_empty());
        if read_only {
            let participants: Vec<NodeId> = self.participants.iter().cloned().collect();
            if !participants.is_empty() {
                // Nothing to apply; just drop the read locks
                self.coordinator.rollback(self.id, &participants).await;
            }
            self.transition(TxState::Preparing);
            self.transition(TxState::Prepared);
            self.transition(TxState::Committing);
            self.finish(TxState::Committed);
            return Ok(());
        }

        self.transition(TxState::Preparing);
        let remap_attempts = self.coordinator.node().config.max_remap_attempts;
        let backoff = self.coordinator.node().config.retry_backoff();
        let mut attempt = 0;

        let (prepared, max_version) = loop {
            let round = self
                .coordinator
                .prepare(
                    self.id,
                    self.options.concurrency,
                    self.prepare_plan(),
                    self.deadline,
                )
                .await;
            self.participants.extend(round.participants.iter().cloned());

            match round.result {
                Ok(max_version) => break (round.participants, max_version),
                Err(e)
                    if self.options.concurrency == Concurrency::Optimistic
                        && matches!(
                            e,
                            Error::StaleTopology { .. } | Error::PartitionUnavailable { .. }
                        )
                        && attempt < remap_attempts =>
                {
                    attempt += 1;
                    let stale: Vec<NodeId> = std::mem::take(&mut self.participants)
                        .into_iter()
                        .collect();
                    self.coordinator.rollback(self.id, &stale).await;
                    let previous = self.id;
                    self.id = TxId::new();
                    tracing::debug!(
                        "Remapping {} as {} after {} (attempt {})",
                        previous,
                        self.id,
                        e,
                        attempt
                    );
                    tokio::time::sleep(backoff * attempt as u32).await;
                }
                Err(e) => return Err(self.fail(e).await),
            }
        };
        self.transition(TxState::Prepared);

        let node = Arc::clone(self.coordinator.node());
        node.versions.observe(max_version);
        let commit_version = node.versions.next();
        self.commit_version = Some(commit_version);
        self.transition(TxState::Committing);

        let lock_only: Vec<NodeId> = self
            .participants
            .iter()
            .filter(|n| !prepared.contains(n))
            .cloned()
            .collect();

        if self.coordinator.config().write_sync_mode == WriteSyncMode::FullAsync {
            let coordinator = self.coordinator.clone();
            let tx_id = self.id;
            node.spawn_background(async move {
                if let Err(e) = coordinator.commit(tx_id, &prepared, commit_version).await {
                    tracing::warn!("Asynchronous commit of {} failed: {}", tx_id, e);
                }
                if !lock_only.is_empty() {
                    coordinator.rollback(tx_id, &lock_only).await;
                }
            });
            self.finish(TxState::Committed);
            return Ok(());
        }

        match self
            .coordinator
            .commit(self.id, &prepared, commit_version)
            .await
        {
            Ok(()) => {
                if !lock_only.is_empty() {
                    self.coordinator.rollback(self.id, &lock_only).await;
                }
                self.finish(TxState::Committed);
                tracing::debug!("Committed {} at {}", self.id, commit_version);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} ended in an unknown state: {}", self.id, e);
                self.finish(TxState::Unknown);
                self.metrics().record_failure(&e);
                Err(e)
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            TxState::Active => {
                self.abort().await;
                Ok(())
            }
            TxState::RolledBack => Ok(()),
            state => Err(Error::InvalidTxState {
                tx_id: self.id.to_string(),
                state: state.to_string(),
                reason: "cannot roll back".into(),
            }),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let state = self.state;
        let metrics = &self.coordinator.node().metrics;
        metrics.active_transactions.dec();
        if state == TxState::Committing {
            metrics.tx_unknown.inc();
            tracing::warn!("{} dropped while committing; outcome unknown", self.id);
            self.state = TxState::Unknown;
            return;
        }
        metrics.tx_rolled_back.inc();
        self.state = TxState::RolledBack;

        let participants: Vec<NodeId> = self.participants.iter().cloned().collect();
        if participants.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(
                "{} dropped outside a runtime; its participants will reap it",
                self.id
            );
            return;
        }

        tracing::debug!("Rolling back dropped {} (was {})", self.id, state);
        let coordinator = self.coordinator.clone();
        let node = Arc::clone(coordinator.node());
        let tx_id = self.id;
        node.spawn_background(async move {
            coordinator.rollback(tx_id, &participants).await;
        });
    }
}

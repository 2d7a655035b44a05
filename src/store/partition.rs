//! Per-partition entry store
//!
//! A HashMap from key to versioned entry. The store only ever moves an entry
//! forward in version order; replicated applies at or below the current
//! version are ignored, which makes redelivery safe.
//!
//! While the rebalancer transfers the partition, the store is frozen and
//! rejects every mutation.

use super::Entry;
use crate::common::{Error, PartitionId, Result};
use crate::tx::Version;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Owning,
    Frozen,
}

#[derive(Debug)]
pub struct PartitionStore {
    cache: String,
    id: PartitionId,
    entries: HashMap<String, Entry>,
    state: PartitionState,
}

impl PartitionStore {
    pub fn new(cache: impl Into<String>, id: PartitionId) -> Self {
        Self {
            cache: cache.into(),
            id,
            entries: HashMap::new(),
            state: PartitionState::Owning,
        }
    }

    /// Live entry for a key; tombstones read as absent
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key).filter(|e| !e.is_tombstone())
    }

    /// Raw entry for a key, including tombstones
    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Current version of a key (`Version::ZERO` if never written)
    pub fn version_of(&self, key: &str) -> Version {
        self.entries
            .get(key)
            .map(|e| e.version)
            .unwrap_or(Version::ZERO)
    }

    /// Write a committed value on the primary.
    ///
    /// The version must be strictly newer than the stored one.
    pub fn put(&mut self, key: &str, value: Vec<u8>, version: Version) -> Result<()> {
        self.write(key, Some(value), version)
    }

    /// Remove a key on the primary, leaving a tombstone at `version`
    pub fn remove(&mut self, key: &str, version: Version) -> Result<()> {
        self.write(key, None, version)
    }

    fn write(&mut self, key: &str, value: Option<Vec<u8>>, version: Version) -> Result<()> {
        self.ensure_owning()?;
        let current = self.version_of(key);
        if version <= current {
            return Err(Error::Internal(format!(
                "out-of-order write to '{}' in partition {}: {} <= {}",
                key, self.id, version, current
            )));
        }
        self.entries
            .insert(key.to_string(), Entry::new(key, value, version));
        Ok(())
    }

    /// Apply a write streamed from the primary.
    ///
    /// Returns false (no-op) if the inbound version is not newer than the
    /// stored one.
    pub fn apply_replicated(
        &mut self,
        key: &str,
        value: Option<Vec<u8>>,
        version: Version,
    ) -> Result<bool> {
        self.ensure_owning()?;
        if version <= self.version_of(key) {
            return Ok(false);
        }
        self.entries
            .insert(key.to_string(), Entry::new(key, value, version));
        Ok(true)
    }

    fn ensure_owning(&self) -> Result<()> {
        match self.state {
            PartitionState::Owning => Ok(()),
            PartitionState::Frozen => Err(Error::PartitionUnavailable {
                cache: self.cache.clone(),
                partition: self.id,
            }),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_tombstone()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting mutations and hand out every entry, tombstones included
    pub fn freeze(&mut self) -> Vec<Entry> {
        self.state = PartitionState::Frozen;
        self.export()
    }

    /// Every entry, tombstones included
    pub fn export(&self) -> Vec<Entry> {
        self.entries.values().cloned().collect()
    }

    pub fn unfreeze(&mut self) {
        self.state = PartitionState::Owning;
    }

    /// Load entries transferred from another owner, keeping the newer version per key
    pub fn import(&mut self, entries: Vec<Entry>) -> usize {
        let mut applied = 0;
        for entry in entries {
            if entry.version > self.version_of(&entry.key) {
                self.entries.insert(entry.key.clone(), entry);
                applied += 1;
            }
        }
        applied
    }
}

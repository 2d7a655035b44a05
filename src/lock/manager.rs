//! Per-key exclusive locks on a primary node
//!
//! At most one transaction holds a key at a time. Waiters queue in FIFO order
//! and are suspended on a oneshot channel until the holder hands the lock
//! over or their deadline passes; nobody spins.

use crate::common::utils::lock;
use crate::common::{Error, Result};
use crate::tx::TxId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Waiter {
    tx_id: TxId,
    grant: oneshot::Sender<()>,
}

struct KeyLock {
    holder: TxId,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock on `key` for `tx_id`, waiting until `deadline`.
    ///
    /// Re-entrant: a transaction that already holds the key gets it again
    /// immediately.
    pub async fn acquire(&self, tx_id: TxId, key: &str, deadline: Instant) -> Result<()> {
        let granted = {
            let mut locks = lock(&self.locks);
            match locks.get_mut(key) {
                None => {
                    locks.insert(
                        key.to_string(),
                        KeyLock {
                            holder: tx_id,
                            waiters: VecDeque::new(),
                        },
                    );
                    return Ok(());
                }
                Some(held) if held.holder == tx_id => return Ok(()),
                Some(held) => {
                    let (grant, granted) = oneshot::channel();
                    held.waiters.push_back(Waiter { tx_id, grant });
                    granted
                }
            }
        };

        match tokio::time::timeout_at(deadline, granted).await {
            Ok(Ok(())) => Ok(()),
            // Wait cancelled by a rollback of this transaction
            Ok(Err(_)) => Err(Self::timeout(tx_id, key)),
            Err(_) => self.abandon_wait(tx_id, key),
        }
    }

    /// Leave the wait queue after a timeout. The lock may have been handed
    /// over right at the deadline, in which case the caller owns it.
    fn abandon_wait(&self, tx_id: TxId, key: &str) -> Result<()> {
        let mut locks = lock(&self.locks);
        if let Some(held) = locks.get_mut(key) {
            if held.holder == tx_id {
                return Ok(());
            }
            held.waiters.retain(|w| w.tx_id != tx_id);
        }
        tracing::debug!("Lock wait on '{}' timed out for {}", key, tx_id);
        Err(Self::timeout(tx_id, key))
    }

    fn timeout(tx_id: TxId, key: &str) -> Error {
        Error::LockTimeout {
            tx_id: tx_id.to_string(),
            key: key.to_string(),
        }
    }

    /// Take the lock only if it is free (or already ours)
    pub fn try_acquire(&self, tx_id: TxId, key: &str) -> bool {
        let mut locks = lock(&self.locks);
        match locks.get(key) {
            None => {
                locks.insert(
                    key.to_string(),
                    KeyLock {
                        holder: tx_id,
                        waiters: VecDeque::new(),
                    },
                );
                true
            }
            Some(held) => held.holder == tx_id,
        }
    }

    /// Release `key` if held by `tx_id`, handing it to the next live waiter
    pub fn release(&self, tx_id: TxId, key: &str) {
        let mut locks = lock(&self.locks);
        Self::release_locked(&mut locks, tx_id, key);
    }

    /// Release every listed key held by `tx_id` and cancel any wait it still has queued
    pub fn release_all<'a>(&self, tx_id: TxId, keys: impl IntoIterator<Item = &'a String>) {
        let mut locks = lock(&self.locks);
        for key in keys {
            Self::release_locked(&mut locks, tx_id, key);
        }
        for held in locks.values_mut() {
            held.waiters.retain(|w| w.tx_id != tx_id);
        }
    }

    fn release_locked(locks: &mut HashMap<String, KeyLock>, tx_id: TxId, key: &str) {
        let Some(held) = locks.get_mut(key) else {
            return;
        };
        if held.holder != tx_id {
            return;
        }
        while let Some(waiter) = held.waiters.pop_front() {
            // A failed send means the waiter already gave up
            if waiter.grant.send(()).is_ok() {
                held.holder = waiter.tx_id;
                return;
            }
        }
        locks.remove(key);
    }

    pub fn holder(&self, key: &str) -> Option<TxId> {
        lock(&self.locks).get(key).map(|held| held.holder)
    }

    pub fn is_held_by(&self, key: &str, tx_id: TxId) -> bool {
        self.holder(key) == Some(tx_id)
    }

    /// Number of keys currently locked
    pub fn locked_count(&self) -> usize {
        lock(&self.locks).len()
    }
}

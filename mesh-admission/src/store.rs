//! Store abstraction for blacklist and run-lock records
//!
//! The hooks never touch the file system directly: they go through the
//! [`BlacklistStore`] and [`RunLockStore`] traits. [`FileStore`](crate::fs_store::FileStore)
//! is the production backend, [`MemoryStore`] the in-memory one used by tests
//! and dry runs.

use crate::types::{InterfaceName, LockRecord, PeerKey};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Keyed persistence of `peer -> blocked_at`
pub trait BlacklistStore {
    /// Blacklist `peer` as of `now` (overwrites an existing entry)
    fn put(&self, peer: &PeerKey, now: u64) -> Result<()>;

    /// Read the blacklist timestamp for `peer`.
    /// A record that exists but cannot be interpreted is an error.
    fn get(&self, peer: &PeerKey) -> Result<Option<u64>>;

    /// Remove the entry for `peer`. Removing an absent entry is not an error.
    fn delete(&self, peer: &PeerKey) -> Result<()>;
}

/// Keyed persistence of per-interface onboarding locks
pub trait RunLockStore {
    /// Read the current lock record for `interface`
    fn read_lock(&self, interface: &InterfaceName) -> Result<Option<LockRecord>>;

    /// Atomically create the lock record. Returns false if one already exists.
    fn try_acquire(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool>;

    /// Overwrite the lock record held by `record.owner_pid`.
    /// Returns false (and writes nothing) if the lock is held by someone else.
    fn replace(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool>;

    /// Remove the lock if (and only if) it is held by `owner_pid`.
    /// Returns whether a record was removed.
    fn release(&self, interface: &InterfaceName, owner_pid: u32) -> Result<bool>;

    /// Remove the lock only if it still holds `observed` (stale or
    /// preempted runs). `None` stands for a record that could not be parsed.
    /// Returns whether a record was removed.
    fn clear_if(&self, interface: &InterfaceName, observed: Option<&LockRecord>) -> Result<bool>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    blacklist: Mutex<HashMap<PeerKey, u64>>,
    locks: Mutex<HashMap<InterfaceName, LockRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blacklisted peers
    pub fn blacklist_len(&self) -> usize {
        self.blacklist.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("Store mutex poisoned")
}

impl BlacklistStore for MemoryStore {
    fn put(&self, peer: &PeerKey, now: u64) -> Result<()> {
        self.blacklist
            .lock()
            .map_err(poisoned)?
            .insert(peer.clone(), now);
        Ok(())
    }

    fn get(&self, peer: &PeerKey) -> Result<Option<u64>> {
        Ok(self.blacklist.lock().map_err(poisoned)?.get(peer).copied())
    }

    fn delete(&self, peer: &PeerKey) -> Result<()> {
        self.blacklist.lock().map_err(poisoned)?.remove(peer);
        Ok(())
    }
}

impl RunLockStore for MemoryStore {
    fn read_lock(&self, interface: &InterfaceName) -> Result<Option<LockRecord>> {
        Ok(self.locks.lock().map_err(poisoned)?.get(interface).copied())
    }

    fn try_acquire(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        if locks.contains_key(interface) {
            return Ok(false);
        }
        locks.insert(interface.clone(), *record);
        Ok(true)
    }

    fn replace(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        match locks.get_mut(interface) {
            Some(current) if current.owner_pid == record.owner_pid => {
                *current = *record;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, interface: &InterfaceName, owner_pid: u32) -> Result<bool> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        match locks.get(interface) {
            Some(current) if current.owner_pid == owner_pid => {
                locks.remove(interface);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_if(&self, interface: &InterfaceName, observed: Option<&LockRecord>) -> Result<bool> {
        let mut locks = self.locks.lock().map_err(poisoned)?;
        match (locks.get(interface), observed) {
            (Some(current), Some(observed)) if current == observed => {
                locks.remove(interface);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

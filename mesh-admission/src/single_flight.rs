//! Per-interface single-flight guard for onboarding runs
//!
//! A run is `running` while a lock record exists whose owner process is
//! still alive. Records left behind by crashed owners, and records that
//! cannot be parsed, are cleared the next time anyone looks at them.
//! Clearing only ever removes the exact record that was observed, so a
//! lock taken by someone else in the meantime survives.

use crate::process::Liveness;
use crate::store::RunLockStore;
use crate::types::{InterfaceName, LockRecord, RunState};

/// Result of trying to claim an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The lock is ours
    Acquired,
    /// Another run holds the lock. `None` if its record could not be read.
    Busy(Option<LockRecord>),
}

/// What a look at the lock found
enum Holder {
    /// No lock, or a stale one that was cleared
    Vacant,
    /// Lock held by a live owner
    Live(LockRecord),
    /// Lock present but its owner could not be probed
    Unknown(LockRecord),
}

/// Lock discipline over a [`RunLockStore`]
pub struct SingleFlight<'a, L, P> {
    locks: &'a L,
    liveness: &'a P,
}

impl<'a, L: RunLockStore, P: Liveness> SingleFlight<'a, L, P> {
    /// Create a guard over `locks`, probing owners with `liveness`
    pub fn new(locks: &'a L, liveness: &'a P) -> Self {
        Self { locks, liveness }
    }

    fn inspect(&self, interface: &InterfaceName) -> Holder {
        let record = match self.locks.read_lock(interface) {
            Ok(Some(record)) => record,
            Ok(None) => return Holder::Vacant,
            Err(e) => {
                log::warn!(
                    "Unreadable onboarding lock for {}, clearing it: {:#}",
                    interface,
                    e
                );
                self.discard(interface, None);
                return Holder::Vacant;
            }
        };

        match self.liveness.is_running(record.owner_pid, record.owner_start) {
            Ok(true) => Holder::Live(record),
            Ok(false) => {
                log::info!(
                    "Clearing stale onboarding lock for {} (owner {} is gone)",
                    interface,
                    record.owner_pid
                );
                self.discard(interface, Some(&record));
                Holder::Vacant
            }
            Err(e) => {
                log::warn!(
                    "Cannot probe onboarding owner {} for {}, assuming no run is active: {:#}",
                    record.owner_pid,
                    interface,
                    e
                );
                Holder::Unknown(record)
            }
        }
    }

    /// Observe the run state of `interface`.
    ///
    /// Never fails: if the lock cannot be read or its owner cannot be
    /// probed, the interface is reported idle.
    pub fn state(&self, interface: &InterfaceName) -> RunState {
        match self.inspect(interface) {
            Holder::Live(record) => RunState::Running(record),
            Holder::Vacant | Holder::Unknown(_) => RunState::Idle,
        }
    }

    /// Try to take the lock for `interface` with `record`.
    /// A holder whose liveness cannot be probed is taken over.
    pub fn try_claim(&self, interface: &InterfaceName, record: &LockRecord) -> anyhow::Result<Claim> {
        if self.locks.try_acquire(interface, record)? {
            return Ok(Claim::Acquired);
        }

        match self.inspect(interface) {
            Holder::Live(holder) => return Ok(Claim::Busy(Some(holder))),
            Holder::Unknown(holder) => self.discard(interface, Some(&holder)),
            Holder::Vacant => {}
        }

        if self.locks.try_acquire(interface, record)? {
            Ok(Claim::Acquired)
        } else {
            Ok(Claim::Busy(self.locks.read_lock(interface).ok().flatten()))
        }
    }

    /// Record the spawned worker in our lock. Returns false if we lost it.
    pub fn set_worker(&self, interface: &InterfaceName, record: &LockRecord) -> bool {
        match self.locks.replace(interface, record) {
            Ok(held) => held,
            Err(e) => {
                log::warn!("Failed to record onboarding worker for {}: {:#}", interface, e);
                true
            }
        }
    }

    /// Whether `owner_pid` still holds the lock for `interface`
    pub fn still_held(&self, interface: &InterfaceName, owner_pid: u32) -> bool {
        match self.locks.read_lock(interface) {
            Ok(Some(record)) => record.owner_pid == owner_pid,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Cannot read onboarding lock for {}: {:#}", interface, e);
                true
            }
        }
    }

    /// Release our lock. Errors are logged, the lock goes stale at worst.
    pub fn release(&self, interface: &InterfaceName, owner_pid: u32) {
        match self.locks.release(interface, owner_pid) {
            Ok(true) => log::debug!("Released onboarding lock for {}", interface),
            Ok(false) => log::debug!("Onboarding lock for {} no longer ours", interface),
            Err(e) => log::warn!("Failed to release onboarding lock for {}: {:#}", interface, e),
        }
    }

    /// Remove the lock if it still holds `observed`
    /// (`None`: the record that could not be parsed)
    pub fn discard(&self, interface: &InterfaceName, observed: Option<&LockRecord>) {
        match self.locks.clear_if(interface, observed) {
            Ok(true) => {}
            Ok(false) => log::debug!("Onboarding lock for {} changed, left in place", interface),
            Err(e) => log::warn!("Failed to clear onboarding lock for {}: {:#}", interface, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_store::FileStore;
    use crate::store::MemoryStore;
    use anyhow::Result;
    use std::cell::Cell;
    use std::collections::HashSet;

    struct Alive(HashSet<u32>);

    impl Liveness for Alive {
        fn is_alive(&self, pid: u32) -> Result<bool> {
            Ok(self.0.contains(&pid))
        }
    }

    struct Unprobeable;

    impl Liveness for Unprobeable {
        fn is_alive(&self, _pid: u32) -> Result<bool> {
            anyhow::bail!("/proc is not mounted")
        }
    }

    /// Another establish clears the stale lock of pid 100 and takes the
    /// interface as pid 200 while we are still probing pid 100
    struct RacingTakeover<'a, L> {
        locks: &'a L,
        raced: Cell<bool>,
    }

    impl<L: RunLockStore> Liveness for RacingTakeover<'_, L> {
        fn is_alive(&self, pid: u32) -> Result<bool> {
            if pid == 100 && !self.raced.replace(true) {
                let stale = self.locks.read_lock(&iface())?;
                self.locks.clear_if(&iface(), stale.as_ref())?;
                assert!(self.locks.try_acquire(&iface(), &record(200))?);
            }
            Ok(pid != 100)
        }
    }

    /// Reports every pid alive, with start time 7000
    struct StartedAt7000;

    impl Liveness for StartedAt7000 {
        fn is_alive(&self, _pid: u32) -> Result<bool> {
            Ok(true)
        }

        fn start_time(&self, _pid: u32) -> Result<Option<u64>> {
            Ok(Some(7000))
        }
    }

    fn iface() -> InterfaceName {
        "vpn00".parse().unwrap()
    }

    fn record(owner: u32) -> LockRecord {
        LockRecord {
            owner_pid: owner,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1000,
        }
    }

    #[test]
    fn test_idle_without_lock() {
        let store = MemoryStore::new();
        let alive = Alive(HashSet::new());
        let guard = SingleFlight::new(&store, &alive);
        assert_eq!(guard.state(&iface()), RunState::Idle);
    }

    #[test]
    fn test_running_with_live_owner() {
        let store = MemoryStore::new();
        let alive = Alive([10].into_iter().collect());
        let guard = SingleFlight::new(&store, &alive);

        assert_eq!(guard.try_claim(&iface(), &record(10)).unwrap(), Claim::Acquired);
        assert_eq!(guard.state(&iface()), RunState::Running(record(10)));
        assert_eq!(
            guard.try_claim(&iface(), &record(11)).unwrap(),
            Claim::Busy(Some(record(10)))
        );
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let store = MemoryStore::new();
        store.try_acquire(&iface(), &record(10)).unwrap();

        let alive = Alive(HashSet::new());
        let guard = SingleFlight::new(&store, &alive);
        assert_eq!(guard.state(&iface()), RunState::Idle);
        assert!(store.read_lock(&iface()).unwrap().is_none());
    }

    #[test]
    fn test_claim_takes_over_stale_lock() {
        let store = MemoryStore::new();
        store.try_acquire(&iface(), &record(10)).unwrap();

        let alive = Alive([11].into_iter().collect());
        let guard = SingleFlight::new(&store, &alive);
        assert_eq!(guard.try_claim(&iface(), &record(11)).unwrap(), Claim::Acquired);
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(record(11)));
    }

    #[test]
    fn test_recycled_owner_pid_is_stale() {
        let store = MemoryStore::new();
        let mut old = record(10);
        old.owner_start = Some(6000);
        store.try_acquire(&iface(), &old).unwrap();

        // pid 10 exists, but it is a different process now
        let guard = SingleFlight::new(&store, &StartedAt7000);
        assert_eq!(guard.state(&iface()), RunState::Idle);
        assert!(store.read_lock(&iface()).unwrap().is_none());

        let mut current = record(11);
        current.owner_start = Some(7000);
        assert_eq!(guard.try_claim(&iface(), &current).unwrap(), Claim::Acquired);
        assert_eq!(guard.state(&iface()), RunState::Running(current));
    }

    #[test]
    fn test_probe_failure_reports_idle() {
        let store = MemoryStore::new();
        store.try_acquire(&iface(), &record(10)).unwrap();

        let guard = SingleFlight::new(&store, &Unprobeable);
        assert_eq!(guard.state(&iface()), RunState::Idle);
        // Observing alone leaves the record in place
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(record(10)));
    }

    #[test]
    fn test_probe_failure_does_not_block_claims() {
        let store = MemoryStore::new();
        store.try_acquire(&iface(), &record(10)).unwrap();

        let guard = SingleFlight::new(&store, &Unprobeable);
        assert_eq!(guard.try_claim(&iface(), &record(11)).unwrap(), Claim::Acquired);
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(record(11)));
        guard.release(&iface(), 11);

        // Nothing is left behind to block the next run either
        assert_eq!(guard.try_claim(&iface(), &record(12)).unwrap(), Claim::Acquired);
    }

    #[test]
    fn test_stale_clear_spares_lock_taken_meanwhile() {
        let store = MemoryStore::new();
        store.try_acquire(&iface(), &record(100)).unwrap();
        let racing = RacingTakeover {
            locks: &store,
            raced: Cell::new(false),
        };
        let guard = SingleFlight::new(&store, &racing);

        assert_eq!(guard.state(&iface()), RunState::Idle);
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(record(200)));

        // A third establish must not get in while 200 runs
        assert_eq!(
            guard.try_claim(&iface(), &record(300)).unwrap(),
            Claim::Busy(Some(record(200)))
        );
    }

    #[test]
    fn test_stale_clear_spares_lock_taken_meanwhile_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("blacklist"), dir.path().join("locks"));
        store.try_acquire(&iface(), &record(100)).unwrap();
        let racing = RacingTakeover {
            locks: &store,
            raced: Cell::new(false),
        };
        let guard = SingleFlight::new(&store, &racing);

        assert_eq!(guard.state(&iface()), RunState::Idle);
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(record(200)));
        assert_eq!(
            guard.try_claim(&iface(), &record(300)).unwrap(),
            Claim::Busy(Some(record(200)))
        );
    }

    #[test]
    fn test_release_and_still_held() {
        let store = MemoryStore::new();
        let alive = Alive([10, 11].into_iter().collect());
        let guard = SingleFlight::new(&store, &alive);

        guard.try_claim(&iface(), &record(10)).unwrap();
        assert!(guard.still_held(&iface(), 10));
        assert!(!guard.still_held(&iface(), 11));

        guard.release(&iface(), 11);
        assert!(guard.still_held(&iface(), 10));

        guard.release(&iface(), 10);
        assert!(!guard.still_held(&iface(), 10));
        assert_eq!(guard.state(&iface()), RunState::Idle);
    }

    #[test]
    fn test_set_worker() {
        let store = MemoryStore::new();
        let alive = Alive([10].into_iter().collect());
        let guard = SingleFlight::new(&store, &alive);
        guard.try_claim(&iface(), &record(10)).unwrap();

        let mut with_worker = record(10);
        with_worker.worker_pid = Some(20);
        assert!(guard.set_worker(&iface(), &with_worker));
        assert_eq!(store.read_lock(&iface()).unwrap(), Some(with_worker));

        guard.discard(&iface(), Some(&with_worker));
        assert!(!guard.set_worker(&iface(), &with_worker));
    }
}

// File-system backed store

//! One file per record, shared by every hook invocation.
//!
//! Blacklist records live in `<blacklist_dir>/<peer_key>` and contain a
//! single UNIX timestamp. Lock records live in `<lock_dir>/<interface>.lock`
//! as `KEY=value` lines so operators can `cat` them:
//!
//! ```text
//! OWNER=4711
//! STARTED=880123
//! WORKER=4712
//! ACQUIRED=1700000000
//! ```
//!
//! Writes go to a temporary file first and are published with `rename`
//! (overwrite) or `hard_link` (create-exclusive), so readers never observe
//! a half-written record. Every change to a lock record happens under an
//! exclusive `flock` on `<lock_dir>/.<interface>.guard`, which makes the
//! owner checks in `replace`, `release` and `clear_if` atomic with the
//! write that follows them.

use crate::store::{BlacklistStore, RunLockStore};
use crate::types::{InterfaceName, LockRecord, PeerKey};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Store rooted at two directories on the local file system
#[derive(Debug, Clone)]
pub struct FileStore {
    blacklist_dir: PathBuf,
    lock_dir: PathBuf,
}

impl FileStore {
    /// Create a store. Directories are created lazily on first write.
    pub fn new(blacklist_dir: PathBuf, lock_dir: PathBuf) -> Self {
        Self {
            blacklist_dir,
            lock_dir,
        }
    }

    /// Directory holding blacklist records
    pub fn blacklist_dir(&self) -> &Path {
        &self.blacklist_dir
    }

    fn blacklist_path(&self, peer: &PeerKey) -> PathBuf {
        self.blacklist_dir.join(peer.as_str())
    }

    fn lock_path(&self, interface: &InterfaceName) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", interface))
    }

    /// Serialize lock changes for `interface` across processes.
    /// The flock is released when the returned file is dropped.
    fn guard(&self, interface: &InterfaceName) -> Result<fs::File> {
        fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("Failed to create directory {}", self.lock_dir.display()))?;

        let path = self.lock_dir.join(format!(".{}.guard", interface));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(file)
    }
}

/// Write `contents` to a uniquely named sibling of `target` and return its path
fn write_temp(target: &Path, contents: &str) -> Result<PathBuf> {
    let dir = target
        .parent()
        .context("Record path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let name = target
        .file_name()
        .context("Record path has no file name")?
        .to_string_lossy();
    let tmp = dir.join(format!(".{}.{}.tmp", name, std::process::id()));

    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = file.sync_all() {
        log::warn!("Failed to sync {}: {}", tmp.display(), e);
    }

    Ok(tmp)
}

/// Move `tmp` over `target`, removing `tmp` if that fails
fn publish(tmp: &Path, target: &Path) -> Result<()> {
    if let Err(e) = fs::rename(tmp, target) {
        if let Err(cleanup) = fs::remove_file(tmp) {
            log::warn!("Failed to remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e).with_context(|| format!("Failed to publish {}", target.display()));
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Read a file, mapping "not found" to `None`
fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Parse the content of a blacklist record
pub fn parse_blacklist_record(content: &str) -> Result<u64> {
    let line = content.lines().next().unwrap_or("").trim();
    line.parse::<u64>()
        .with_context(|| format!("Malformed blacklist record: {:?}", line))
}

/// Serialize a lock record
pub fn format_lock_record(record: &LockRecord) -> String {
    format!(
        "OWNER={}\nSTARTED={}\nWORKER={}\nACQUIRED={}\n",
        record.owner_pid,
        record.owner_start.map(|t| t.to_string()).unwrap_or_default(),
        record.worker_pid.map(|p| p.to_string()).unwrap_or_default(),
        record.acquired_at
    )
}

/// Parse a lock record written by [`format_lock_record`]
pub fn parse_lock_record(content: &str) -> Result<LockRecord> {
    let mut owner = None;
    let mut started = None;
    let mut worker = None;
    let mut acquired = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "OWNER" => owner = Some(value.parse::<u32>().context("Invalid OWNER")?),
            "STARTED" if !value.is_empty() => {
                started = Some(value.parse::<u64>().context("Invalid STARTED")?)
            }
            "WORKER" if !value.is_empty() => {
                worker = Some(value.parse::<u32>().context("Invalid WORKER")?)
            }
            "ACQUIRED" => acquired = Some(value.parse::<u64>().context("Invalid ACQUIRED")?),
            _ => {}
        }
    }

    Ok(LockRecord {
        owner_pid: owner.context("Lock record missing OWNER")?,
        owner_start: started,
        worker_pid: worker,
        acquired_at: acquired.context("Lock record missing ACQUIRED")?,
    })
}

impl BlacklistStore for FileStore {
    fn put(&self, peer: &PeerKey, now: u64) -> Result<()> {
        let path = self.blacklist_path(peer);
        let tmp = write_temp(&path, &format!("{}\n", now))?;
        publish(&tmp, &path)
    }

    fn get(&self, peer: &PeerKey) -> Result<Option<u64>> {
        let path = self.blacklist_path(peer);
        match read_if_exists(&path)? {
            Some(content) => parse_blacklist_record(&content)
                .with_context(|| format!("Bad record {}", path.display()))
                .map(Some),
            None => Ok(None),
        }
    }

    fn delete(&self, peer: &PeerKey) -> Result<()> {
        remove_if_exists(&self.blacklist_path(peer))?;
        Ok(())
    }
}

impl RunLockStore for FileStore {
    fn read_lock(&self, interface: &InterfaceName) -> Result<Option<LockRecord>> {
        let path = self.lock_path(interface);
        match read_if_exists(&path)? {
            Some(content) => parse_lock_record(&content)
                .with_context(|| format!("Bad lock {}", path.display()))
                .map(Some),
            None => Ok(None),
        }
    }

    fn try_acquire(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool> {
        let _guard = self.guard(interface)?;
        let path = self.lock_path(interface);
        let tmp = write_temp(&path, &format_lock_record(record))?;

        // hard_link fails with AlreadyExists instead of overwriting
        let result = fs::hard_link(&tmp, &path);
        if let Err(e) = fs::remove_file(&tmp) {
            log::warn!("Failed to remove {}: {}", tmp.display(), e);
        }

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
        }
    }

    fn replace(&self, interface: &InterfaceName, record: &LockRecord) -> Result<bool> {
        let _guard = self.guard(interface)?;
        match self.read_lock(interface)? {
            Some(current) if current.owner_pid == record.owner_pid => {}
            _ => return Ok(false),
        }

        let path = self.lock_path(interface);
        let tmp = write_temp(&path, &format_lock_record(record))?;
        publish(&tmp, &path)?;
        Ok(true)
    }

    fn release(&self, interface: &InterfaceName, owner_pid: u32) -> Result<bool> {
        let _guard = self.guard(interface)?;
        match self.read_lock(interface)? {
            Some(current) if current.owner_pid == owner_pid => {
                remove_if_exists(&self.lock_path(interface))
            }
            _ => Ok(false),
        }
    }

    fn clear_if(&self, interface: &InterfaceName, observed: Option<&LockRecord>) -> Result<bool> {
        let _guard = self.guard(interface)?;
        let matches = match (self.read_lock(interface), observed) {
            (Ok(Some(current)), Some(observed)) => current == *observed,
            (Err(_), None) => true,
            _ => false,
        };

        if matches {
            remove_if_exists(&self.lock_path(interface))
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("blacklist"), dir.path().join("locks"))
    }

    fn peer(s: &str) -> PeerKey {
        s.parse().unwrap()
    }

    fn iface(s: &str) -> InterfaceName {
        s.parse().unwrap()
    }

    #[test]
    fn test_blacklist_record_format() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&peer("k1"), 1_700_000_000).unwrap();

        let content = fs::read_to_string(dir.path().join("blacklist").join("k1")).unwrap();
        assert_eq!(content, "1700000000\n");
        assert_eq!(store.get(&peer("k1")).unwrap(), Some(1_700_000_000));
    }

    #[test]
    fn test_blacklist_missing_dir_reads_absent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.get(&peer("k1")).unwrap(), None);
        assert!(store.delete(&peer("k1")).is_ok());
    }

    #[test]
    fn test_blacklist_delete_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&peer("k1"), 5).unwrap();
        store.delete(&peer("k1")).unwrap();
        store.delete(&peer("k1")).unwrap();
        assert_eq!(store.get(&peer("k1")).unwrap(), None);
    }

    #[test]
    fn test_blacklist_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&peer("k1"), 5).unwrap();
        store.put(&peer("k1"), 7).unwrap();
        assert_eq!(store.get(&peer("k1")).unwrap(), Some(7));
    }

    #[test]
    fn test_blacklist_record_written_by_script() {
        // Records written with `date +%s > file` carry a trailing newline
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(dir.path().join("blacklist")).unwrap();
        fs::write(dir.path().join("blacklist").join("k1"), "1000\n").unwrap();
        assert_eq!(store.get(&peer("k1")).unwrap(), Some(1000));
    }

    #[test]
    fn test_blacklist_malformed_is_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(dir.path().join("blacklist")).unwrap();
        fs::write(dir.path().join("blacklist").join("k1"), "yesterday\n").unwrap();
        assert!(store.get(&peer("k1")).is_err());

        fs::write(dir.path().join("blacklist").join("k2"), "").unwrap();
        assert!(store.get(&peer("k2")).is_err());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put(&peer("k1"), 5).unwrap();
        let record = LockRecord {
            owner_pid: 1,
            owner_start: None,
            worker_pid: None,
            acquired_at: 5,
        };
        store.try_acquire(&iface("vpn00"), &record).unwrap();
        store.try_acquire(&iface("vpn00"), &record).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path().join("locks"))
            .unwrap()
            .chain(fs::read_dir(dir.path().join("blacklist")).unwrap())
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
    }

    #[test]
    fn test_lock_round_trip_and_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = LockRecord {
            owner_pid: 100,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1000,
        };
        let second = LockRecord {
            owner_pid: 200,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1001,
        };

        assert!(store.try_acquire(&iface("vpn00"), &first).unwrap());
        assert!(!store.try_acquire(&iface("vpn00"), &second).unwrap());
        assert_eq!(store.read_lock(&iface("vpn00")).unwrap(), Some(first));

        let content = fs::read_to_string(dir.path().join("locks").join("vpn00.lock")).unwrap();
        assert_eq!(content, "OWNER=100\nSTARTED=\nWORKER=\nACQUIRED=1000\n");
    }

    #[test]
    fn test_lock_replace_and_release() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut record = LockRecord {
            owner_pid: 100,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1000,
        };
        store.try_acquire(&iface("vpn00"), &record).unwrap();

        record.worker_pid = Some(101);
        assert!(store.replace(&iface("vpn00"), &record).unwrap());
        assert_eq!(
            store.read_lock(&iface("vpn00")).unwrap().unwrap().worker_pid,
            Some(101)
        );

        assert!(!store.release(&iface("vpn00"), 999).unwrap());
        assert!(store.release(&iface("vpn00"), 100).unwrap());
        assert!(!store.release(&iface("vpn00"), 100).unwrap());
        assert!(store.read_lock(&iface("vpn00")).unwrap().is_none());
    }

    #[test]
    fn test_lock_clear_if() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let record = LockRecord {
            owner_pid: 100,
            owner_start: Some(5555),
            worker_pid: Some(7),
            acquired_at: 1000,
        };
        store.try_acquire(&iface("vpn00"), &record).unwrap();
        assert_eq!(store.read_lock(&iface("vpn00")).unwrap(), Some(record));

        let mut other = record;
        other.owner_start = Some(6666);
        assert!(!store.clear_if(&iface("vpn00"), Some(&other)).unwrap());
        assert!(!store.clear_if(&iface("vpn00"), None).unwrap());

        assert!(store.clear_if(&iface("vpn00"), Some(&record)).unwrap());
        assert!(!store.clear_if(&iface("vpn00"), Some(&record)).unwrap());
        assert!(store.try_acquire(&iface("vpn00"), &record).unwrap());
    }

    #[test]
    fn test_clear_if_keeps_lock_taken_after_observation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let stale = LockRecord {
            owner_pid: 100,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1000,
        };
        let fresh = LockRecord {
            owner_pid: 200,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1001,
        };
        store.try_acquire(&iface("vpn00"), &stale).unwrap();
        let observed = store.read_lock(&iface("vpn00")).unwrap().unwrap();

        // Another establish clears the stale record and takes the lock
        assert!(store.clear_if(&iface("vpn00"), Some(&observed)).unwrap());
        assert!(store.try_acquire(&iface("vpn00"), &fresh).unwrap());

        // The late clearer and the late releaser leave it alone
        assert!(!store.clear_if(&iface("vpn00"), Some(&observed)).unwrap());
        assert!(!store.release(&iface("vpn00"), 100).unwrap());
        assert_eq!(store.read_lock(&iface("vpn00")).unwrap(), Some(fresh));
    }

    #[test]
    fn test_clear_if_unreadable_lock() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(dir.path().join("locks")).unwrap();
        fs::write(dir.path().join("locks").join("vpn00.lock"), "junk").unwrap();

        let record = LockRecord {
            owner_pid: 100,
            owner_start: None,
            worker_pid: None,
            acquired_at: 1000,
        };
        assert!(!store.clear_if(&iface("vpn00"), Some(&record)).unwrap());
        assert!(store.clear_if(&iface("vpn00"), None).unwrap());
        assert!(store.read_lock(&iface("vpn00")).unwrap().is_none());
    }

    #[test]
    fn test_failed_publish_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        // A directory where the record should go makes the rename fail
        fs::create_dir_all(dir.path().join("blacklist").join("k1").join("x")).unwrap();

        assert!(store.put(&peer("k1"), 5).is_err());
        let names: Vec<String> = fs::read_dir(dir.path().join("blacklist"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["k1".to_string()]);
    }

    #[test]
    fn test_parse_lock_record() {
        let record = parse_lock_record("OWNER=1\nWORKER=2\nACQUIRED=3\n").unwrap();
        assert_eq!(record.owner_pid, 1);
        assert_eq!(record.worker_pid, Some(2));
        assert_eq!(record.acquired_at, 3);

        let record = parse_lock_record("ACQUIRED=3\nOWNER=1\n").unwrap();
        assert_eq!(record.worker_pid, None);
        assert_eq!(record.owner_start, None);

        let record = parse_lock_record("OWNER=1\nSTARTED=77\nWORKER=\nACQUIRED=3\n").unwrap();
        assert_eq!(record.owner_start, Some(77));

        assert!(parse_lock_record("").is_err());
        assert!(parse_lock_record("OWNER=x\nACQUIRED=3\n").is_err());
        assert!(parse_lock_record("OWNER=1\n").is_err());
    }

    #[test]
    fn test_parse_blacklist_record() {
        assert_eq!(parse_blacklist_record("42").unwrap(), 42);
        assert_eq!(parse_blacklist_record(" 42 \n").unwrap(), 42);
        assert!(parse_blacklist_record("-1").is_err());
        assert!(parse_blacklist_record("4 2").is_err());
    }
}

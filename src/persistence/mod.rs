//! Persistence Module
//!
//! Crash-consistent snapshots of the [`Store`].
//!
//! ## Save Discipline
//!
//! ```text
//! Store::snapshot()        point-in-time copy, shard locks released
//!       │
//!       ▼
//! format::encode()         header, records, CRC-32
//!       │
//!       ▼
//! write <file>.tmp         same directory as the target
//! flush + fsync
//!       │
//!       ▼
//! rename over <file>       atomic: readers see old or new, never a mix
//! ```
//!
//! If anything fails before the rename, the temporary file is removed and the
//! existing snapshot is left byte-for-byte untouched. A process killed in the
//! middle leaves at worst a stray `.tmp` file, which `load` ignores.
//!
//! ## Modules
//!
//! - `format`: the snapshot byte layout
//! - `scheduler`: the background task that runs periodic and requested saves

pub mod format;
pub mod scheduler;

pub use scheduler::{PersistenceConfig, SaveTrigger, SnapshotScheduler};

use crate::storage::Store;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while saving or loading a snapshot.
#[derive(Debug, Error, Clone)]
pub enum PersistenceError {
    /// Filesystem failure (disk full, permission denied, ...)
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The snapshot file exists but cannot be decoded
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// No snapshot path is configured
    #[error("persistence is disabled")]
    Disabled,

    /// The snapshot scheduler is no longer running
    #[error("snapshot scheduler is not running")]
    Stopped,
}

impl From<io::Error> for PersistenceError {
    fn from(e: io::Error) -> Self {
        PersistenceError::Io(Arc::new(e))
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub keys: u64,
    pub bytes: u64,
    /// Snapshot time (Unix ms)
    pub saved_at: u64,
}

/// Outcome of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: u64,
    /// Records whose deadline passed while the snapshot was at rest
    pub dropped: u64,
}

/// Saves and loads one store to and from one snapshot file.
///
/// All methods block on filesystem I/O; async callers go through
/// [`SnapshotScheduler`], which runs them on the blocking pool.
///
/// Saves through one `Persistence` are serialized: a second `save` waits
/// until the first one has renamed or discarded the shared temporary file.
#[derive(Debug)]
pub struct Persistence {
    store: Arc<Store>,
    path: PathBuf,
    /// Held from `stage` until the staged file is committed or dropped
    save_lock: Mutex<()>,
    /// Unix ms of the last successful save (0 = never)
    last_save: AtomicU64,
    saves: AtomicU64,
}

impl Persistence {
    pub fn new(store: Arc<Store>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
            save_lock: Mutex::new(()),
            last_save: AtomicU64::new(0),
            saves: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unix ms of the last successful save, if any.
    pub fn last_save(&self) -> Option<u64> {
        match self.last_save.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    /// Number of successful saves since startup.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Copies the store and writes it to the temporary file, without
    /// touching the real snapshot yet.
    ///
    /// Blocks while another save on this `Persistence` is in progress. The
    /// returned [`StagedSnapshot`] keeps other saves out until it is
    /// committed or dropped.
    pub fn stage(&self) -> Result<StagedSnapshot<'_>, PersistenceError> {
        let guard = self.save_lock.lock();

        let snapshot = self.store.snapshot();
        let image = format::encode(snapshot.taken_at, &snapshot.entries);
        let tmp_path = temp_path(&self.path);

        let written = write_synced(&tmp_path, &image);
        if let Err(e) = written {
            discard(&tmp_path);
            return Err(e.into());
        }

        Ok(StagedSnapshot {
            tmp_path,
            target: self.path.clone(),
            report: SaveReport {
                keys: snapshot.entries.len() as u64,
                bytes: image.len() as u64,
                saved_at: snapshot.taken_at,
            },
            committed: false,
            _guard: guard,
        })
    }

    /// Writes a complete snapshot, all-or-nothing.
    pub fn save(&self) -> Result<SaveReport, PersistenceError> {
        let report = self.stage()?.commit()?;

        self.last_save.store(report.saved_at, Ordering::Relaxed);
        self.saves.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %self.path.display(),
            keys = report.keys,
            bytes = report.bytes,
            "Snapshot saved"
        );
        Ok(report)
    }

    /// Restores the store from the snapshot file.
    ///
    /// A missing file is a first run, not an error. Records whose deadline has
    /// already passed are dropped.
    pub fn load(&self) -> Result<LoadReport, PersistenceError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting empty");
                return Ok(LoadReport::default());
            }
            Err(e) => return Err(e.into()),
        };

        let file = format::decode(data.into())?;
        let restored = self.store.restore(file.entries);

        info!(
            path = %self.path.display(),
            loaded = restored.loaded,
            dropped = restored.dropped,
            saved_at = file.saved_at,
            "Snapshot loaded"
        );
        Ok(LoadReport {
            loaded: restored.loaded,
            dropped: restored.dropped,
        })
    }
}

/// A fully written temporary snapshot waiting to be renamed into place.
///
/// Dropping it without calling [`StagedSnapshot::commit`] deletes the
/// temporary file and leaves the real snapshot as it was.
#[derive(Debug)]
pub struct StagedSnapshot<'a> {
    tmp_path: PathBuf,
    target: PathBuf,
    report: SaveReport,
    committed: bool,
    /// Released after `Drop::drop` has run, so cleanup happens under the lock
    _guard: MutexGuard<'a, ()>,
}

impl StagedSnapshot<'_> {
    pub fn temp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Atomically replaces the target with the staged file.
    pub fn commit(mut self) -> Result<SaveReport, PersistenceError> {
        fs::rename(&self.tmp_path, &self.target)?;
        self.committed = true;
        sync_parent_dir(&self.target);
        Ok(self.report)
    }
}

impl Drop for StagedSnapshot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            discard(&self.tmp_path);
        }
    }
}

/// `<dir>/<name>.tmp` next to the target, so the rename stays on one filesystem.
fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Discarded temporary snapshot"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary snapshot"),
    }
}

/// Makes the rename itself durable. Best effort: not every platform allows
/// opening a directory.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(path = %parent.display(), error = %e, "Directory fsync skipped");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ManualClock, Value};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_save_then_load_into_fresh_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let clock = Arc::new(ManualClock::starting_now());

        let store = Arc::new(Store::with_clock(clock.clone()));
        store.set(key("a"), Value::from("10"), None);
        store.set(key("b"), Value::from("hello"), None);
        store.set(key("c"), Value::from("x"), Some(Duration::from_secs(100)));

        let report = assert_ok!(Persistence::new(Arc::clone(&store), &path).save());
        assert_eq!(report.keys, 3);
        assert!(!temp_path(&path).exists());

        let fresh = Arc::new(Store::with_clock(clock.clone()));
        let loaded = assert_ok!(Persistence::new(Arc::clone(&fresh), &path).load());
        assert_eq!(loaded, LoadReport { loaded: 3, dropped: 0 });

        assert_eq!(fresh.get(&key("a")), Some(Value::Int(10)));
        assert_eq!(fresh.get(&key("b")), Some(Value::from("hello")));
        assert_eq!(fresh.ttl(&key("c")).as_secs(), 100);
        assert_eq!(fresh.len(), 3);
    }

    #[test]
    fn test_load_missing_file_is_first_run() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new());
        let persistence = Persistence::new(Arc::clone(&store), dir.path().join("absent.ekv"));

        assert_eq!(assert_ok!(persistence.load()), LoadReport::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        fs::write(&path, b"definitely not a snapshot").unwrap();

        let persistence = Persistence::new(Arc::new(Store::new()), &path);
        let err = assert_err!(persistence.load());
        assert!(matches!(err, PersistenceError::Corrupt(_)));
    }

    #[test]
    fn test_load_drops_keys_that_expired_at_rest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let clock = Arc::new(ManualClock::starting_now());

        let store = Arc::new(Store::with_clock(clock.clone()));
        store.set(key("short"), Value::from("1"), Some(Duration::from_secs(5)));
        store.set(key("long"), Value::from("2"), Some(Duration::from_secs(500)));
        assert_ok!(Persistence::new(store, &path).save());

        clock.advance(Duration::from_secs(60));

        let fresh = Arc::new(Store::with_clock(clock.clone()));
        let loaded = assert_ok!(Persistence::new(Arc::clone(&fresh), &path).load());
        assert_eq!(loaded, LoadReport { loaded: 1, dropped: 1 });
        assert!(!fresh.is_resident(b"short"));
        assert_eq!(fresh.ttl(&key("long")).as_secs(), 440);
    }

    #[test]
    fn test_crash_before_rename_leaves_old_snapshot_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");

        let store = Arc::new(Store::new());
        let persistence = Persistence::new(Arc::clone(&store), &path);

        store.set(key("version"), Value::from("one"), None);
        assert_ok!(persistence.save());
        let before = fs::read(&path).unwrap();

        store.set(key("version"), Value::from("two"), None);
        store.set(key("extra"), Value::from("x"), None);
        let staged = assert_ok!(persistence.stage());
        assert!(staged.temp_path().exists());

        // Process dies here: no rename, no cleanup
        std::mem::forget(staged);

        assert_eq!(fs::read(&path).unwrap(), before);

        let recovered = Arc::new(Store::new());
        assert_ok!(Persistence::new(Arc::clone(&recovered), &path).load());
        assert_eq!(recovered.get(&key("version")), Some(Value::from("one")));
        assert!(!recovered.exists(&key("extra")));
    }

    #[test]
    fn test_abandoned_stage_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let persistence = Persistence::new(Arc::new(Store::new()), &path);

        let staged = assert_ok!(persistence.stage());
        let tmp = staged.temp_path().to_path_buf();
        drop(staged);

        assert!(!tmp.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_save_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let store = Arc::new(Store::new());
        let persistence = Persistence::new(Arc::clone(&store), &path);

        store.set(key("k"), Value::from("v"), None);
        assert_ok!(persistence.save());
        let before = fs::read(&path).unwrap();

        // A directory squatting on the temp path makes the write fail
        fs::create_dir(temp_path(&path)).unwrap();
        store.set(key("k"), Value::from("changed"), None);
        let err = assert_err!(persistence.save());
        assert!(matches!(err, PersistenceError::Io(_)));

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(persistence.saves(), 1);
    }

    #[test]
    fn test_concurrent_saves_all_succeed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let store = Arc::new(Store::new());
        for i in 0..20_000 {
            store.set(key(&format!("key:{}", i)), Value::from("payload"), None);
        }
        let persistence = Arc::new(Persistence::new(Arc::clone(&store), &path));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let persistence = Arc::clone(&persistence);
                std::thread::spawn(move || {
                    (0..30)
                        .filter(|_| persistence.save().is_err())
                        .count()
                })
            })
            .collect();

        let failures: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(failures, 0);
        assert_eq!(persistence.saves(), 120);
        assert!(!temp_path(&path).exists());

        let fresh = Arc::new(Store::new());
        let loaded = assert_ok!(Persistence::new(Arc::clone(&fresh), &path).load());
        assert_eq!(loaded.loaded, 20_000);
    }

    #[test]
    fn test_staged_snapshot_holds_off_other_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.ekv");
        let store = Arc::new(Store::new());
        store.set(key("k"), Value::from("v"), None);
        let persistence = Arc::new(Persistence::new(Arc::clone(&store), &path));

        let staged = assert_ok!(persistence.stage());

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let saver = {
            let persistence = Arc::clone(&persistence);
            std::thread::spawn(move || {
                let result = persistence.save();
                let _ = done_tx.send(());
                result
            })
        };

        // The second save cannot start while the first is staged
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(staged.temp_path().exists());

        assert_ok!(staged.commit());
        assert_ok!(done_rx.recv_timeout(Duration::from_secs(5)));
        assert_ok!(saver.join().unwrap());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_temp_path_is_a_sibling() {
        assert_eq!(
            temp_path(Path::new("/var/lib/ember/dump.ekv")),
            PathBuf::from("/var/lib/ember/dump.ekv.tmp")
        );
        assert_eq!(temp_path(Path::new("dump.ekv")), PathBuf::from("dump.ekv.tmp"));
    }
}

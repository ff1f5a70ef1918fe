//! Thread-Safe Store with Expiry Support
//!
//! The store owns every [`Entry`] and the [`ExpiryIndex`] that schedules their
//! deadlines. No other component touches entries directly.
//!
//! ## Design Decisions
//!
//! 1. **Sharded Locks**: 64 shards, each a `parking_lot::RwLock`, so callers
//!    working on different keys rarely contend.
//! 2. **Index Inside the Shard**: a shard's entries and its slice of the expiry
//!    heap sit behind the same lock. `set` with a TTL inserts the entry and
//!    schedules its deadline in one critical section, so a key is never visible
//!    before its expiry is discoverable.
//! 3. **Lazy + Active Expiry**: every access re-validates the deadline; the
//!    background sweeper drains due heap records through [`Store::reap_due`].
//! 4. **Single-Lock Compound Ops**: `incr` reads, checks and writes under one
//!    write guard, which makes it linearizable against `get`/`set`/`delete`.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Store                               │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐ │
//! │  │  Shard 0   │ │  Shard 1   │ │  Shard 2   │ │  Shard 63  │ │
//! │  │  RwLock {  │ │  RwLock {  │ │  RwLock {  │ │  RwLock {  │ │
//! │  │   entries  │ │   entries  │ │   entries  │ │   entries  │ │
//! │  │   expiry   │ │   expiry   │ │   expiry   │ │   expiry   │ │
//! │  │  }         │ │  }         │ │  }         │ │  }         │ │
//! │  └────────────┘ └────────────┘ └────────────┘ └────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Single-key operations hold exactly one shard lock. Whole-store operations
//! (`flush_all`, `snapshot`) take every shard lock in ascending order.

use crate::storage::clock::{duration_millis, Clock, SystemClock};
use crate::storage::entry::{Entry, Value};
use crate::storage::index::ExpiryIndex;
use crate::storage::pattern::glob_match;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Number of shards for the store.
const NUM_SHARDS: usize = 64;

/// Reply value of `TTL` for a missing key.
pub const TTL_NOT_FOUND: i64 = -2;

/// Reply value of `TTL` for a key without a deadline.
pub const TTL_NO_EXPIRY: i64 = -1;

/// Errors from compound store operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The stored value is not an integer
    #[error("value is not an integer")]
    TypeMismatch,

    /// The result would leave the i64 range
    #[error("increment or decrement would overflow")]
    Overflow,
}

/// Remaining lifetime of a key as seen by `TTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    NotFound,
    NoExpiry,
    /// Milliseconds until the deadline
    ExpiresIn(u64),
}

impl TtlStatus {
    /// Whole seconds, rounded up, with the -2 / -1 sentinels.
    pub fn as_secs(self) -> i64 {
        match self {
            TtlStatus::NotFound => TTL_NOT_FOUND,
            TtlStatus::NoExpiry => TTL_NO_EXPIRY,
            TtlStatus::ExpiresIn(ms) => ms.div_ceil(1000) as i64,
        }
    }

    /// Milliseconds, with the -2 / -1 sentinels.
    pub fn as_millis(self) -> i64 {
        match self {
            TtlStatus::NotFound => TTL_NOT_FOUND,
            TtlStatus::NoExpiry => TTL_NO_EXPIRY,
            TtlStatus::ExpiresIn(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
        }
    }
}

/// A point-in-time copy of every live entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// When the copy was taken (Unix ms)
    pub taken_at: u64,
    pub entries: Vec<(Bytes, Entry)>,
}

/// Outcome of loading entries into the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub loaded: u64,
    /// Entries whose deadline had already passed
    pub dropped: u64,
}

/// Outcome of one active-expiration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Keys removed because they were really due
    pub expired: u64,
    /// Heap records discarded because the store disagreed
    pub stale: u64,
    /// At least one shard still had due records when it hit the cap
    pub saturated: bool,
    /// Smallest deadline left in any shard's heap
    pub next_deadline: Option<u64>,
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    /// Entries currently resident (may include expired, not yet reaped ones)
    pub keys: u64,
    /// Resident entries that carry a deadline
    pub expiring_keys: u64,
    /// Records in the expiry heaps, stale ones included
    pub pending_expiries: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    /// Keys removed on access
    pub expired_lazy: u64,
    /// Keys removed by the sweeper
    pub expired_active: u64,
    /// Heap records found stale by the sweeper
    pub stale_skipped: u64,
}

#[derive(Debug, Default)]
struct ShardState {
    entries: HashMap<Bytes, Entry>,
    expiry: ExpiryIndex,
}

impl ShardState {
    /// Removes `key` if it is present and dead. Returns true if it was removed.
    fn expire_if_due(&mut self, key: &[u8], now: u64) -> bool {
        if self.entries.get(key).is_some_and(|e| e.is_expired_at(now)) {
            self.entries.remove(key);
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Shard {
    state: RwLock<ShardState>,
}

/// The cache's key space.
///
/// Designed to be wrapped in an `Arc` and shared by connection tasks, the
/// expiry sweeper and the snapshot scheduler.
///
/// # Example
///
/// ```
/// use emberkv::storage::{Store, Value};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let store = Store::new();
///
/// store.set(Bytes::from("name"), Value::from("ember"), None);
/// assert_eq!(store.get(&Bytes::from("name")), Some(Value::from("ember")));
///
/// store.set(Bytes::from("session"), Value::from("abc"), Some(Duration::from_secs(60)));
/// assert_eq!(store.incr(&Bytes::from("hits"), 1), Ok(1));
/// ```
pub struct Store {
    shards: Vec<Shard>,
    clock: Arc<dyn Clock>,

    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_lazy: AtomicU64,
    expired_active: AtomicU64,
    stale_skipped: AtomicU64,

    /// Wakes the sweeper when a deadline earlier than its plan is scheduled
    expiry_wakeup: Notify,
    /// When the sweeper intends to wake next (Unix ms)
    planned_wakeup: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("shards", &self.shards.len())
            .field("clock", &self.clock)
            .field("get_count", &self.get_count.load(Ordering::Relaxed))
            .field("set_count", &self.set_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::default()).collect(),
            clock,
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_lazy: AtomicU64::new(0),
            expired_active: AtomicU64::new(0),
            stale_skipped: AtomicU64::new(0),
            expiry_wakeup: Notify::new(),
            planned_wakeup: AtomicU64::new(u64::MAX),
        }
    }

    /// Current time according to the store's clock (Unix ms).
    #[inline]
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Runs `f` on the live entry for `key`, expiring it first if it is due.
    fn lookup<T>(&self, key: &[u8], now: u64, f: impl Fn(&Entry) -> T) -> Option<T> {
        let shard = self.shard(key);

        // Fast path: shared lock for missing or live keys
        {
            let state = shard.state.read();
            match state.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired_at(now) => return Some(f(entry)),
                Some(_) => {}
            }
        }

        // Dead entry: take the write lock and re-validate before removing
        let mut state = shard.state.write();
        if state.expire_if_due(key, now) {
            self.expired_lazy.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // Another caller replaced it in between
        state.entries.get(key).map(f)
    }

    /// Gets the value for a key, or None if it is missing or expired.
    ///
    /// An expired entry found here is deleted (lazy expiry).
    pub fn get(&self, key: &Bytes) -> Option<Value> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.lookup(key, self.now_millis(), |e| e.value.clone())
    }

    /// Inserts or wholesale replaces a key.
    ///
    /// Any previous deadline is discarded; with `ttl` a new deadline is
    /// registered in the expiry index under the same lock.
    ///
    /// # Returns
    ///
    /// Returns `true` if no live entry existed before.
    pub fn set(&self, key: Bytes, value: Value, ttl: Option<Duration>) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let now = self.now_millis();
        let deadline = ttl.map(|ttl| now.saturating_add(duration_millis(ttl)));
        let entry = match deadline {
            Some(at) => Entry::with_deadline(value, now, at),
            None => Entry::new(value, now),
        };

        let is_new = {
            let mut state = self.shard(&key).state.write();
            if let Some(at) = deadline {
                state.expiry.schedule(at, key.clone());
            }
            state
                .entries
                .insert(key, entry)
                .is_none_or(|old| old.is_expired_at(now))
        };

        if let Some(at) = deadline {
            self.wake_sweeper_if_earlier(at);
        }

        is_new
    }

    /// Deletes a key.
    ///
    /// # Returns
    ///
    /// Returns `true` if a live entry was removed. The expiry index is left
    /// alone; its record for this key becomes stale.
    pub fn delete(&self, key: &Bytes) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let now = self.now_millis();
        let mut state = self.shard(key).state.write();
        match state.entries.remove(key) {
            Some(entry) if entry.is_expired_at(now) => {
                self.expired_lazy.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Deletes several keys, returning how many live ones were removed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|k| self.delete(k)).count() as u64
    }

    /// Checks if a key exists. Same lazy-expiry side effect as [`Store::get`].
    pub fn exists(&self, key: &Bytes) -> bool {
        self.lookup(key, self.now_millis(), |_| ()).is_some()
    }

    /// Counts how many of the given keys exist.
    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|k| self.exists(k)).count() as u64
    }

    /// Remaining lifetime of a key.
    pub fn ttl(&self, key: &Bytes) -> TtlStatus {
        let now = self.now_millis();
        match self.lookup(key, now, |e| e.remaining_ms(now)) {
            None => TtlStatus::NotFound,
            Some(None) => TtlStatus::NoExpiry,
            Some(Some(ms)) => TtlStatus::ExpiresIn(ms),
        }
    }

    /// Adds `delta` to an integer value in one critical section.
    ///
    /// A missing (or expired) key counts as 0 with no deadline. An existing
    /// deadline is preserved. On error the stored value is unchanged.
    pub fn incr(&self, key: &Bytes, delta: i64) -> Result<i64, StoreError> {
        let now = self.now_millis();
        let mut state = self.shard(key).state.write();

        if state.expire_if_due(key, now) {
            self.expired_lazy.fetch_add(1, Ordering::Relaxed);
        }

        match state.entries.get_mut(key) {
            Some(entry) => {
                let current = entry.value.as_integer().ok_or(StoreError::TypeMismatch)?;
                let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
                entry.value = Value::Int(next);
                Ok(next)
            }
            None => {
                state
                    .entries
                    .insert(key.clone(), Entry::new(Value::Int(delta), now));
                Ok(delta)
            }
        }
    }

    /// Decrements an integer value; see [`Store::incr`].
    pub fn decr(&self, key: &Bytes, delta: i64) -> Result<i64, StoreError> {
        let delta = delta.checked_neg().ok_or(StoreError::Overflow)?;
        self.incr(key, delta)
    }

    /// Atomically clears every shard, expiry heaps included.
    ///
    /// # Returns
    ///
    /// Returns the number of resident entries dropped.
    pub fn flush_all(&self) -> u64 {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.state.write()).collect();
        let mut dropped = 0;
        for state in guards.iter_mut() {
            dropped += state.entries.len() as u64;
            state.entries.clear();
            state.expiry.clear();
        }
        dropped
    }

    /// Returns all live keys matching a glob pattern.
    ///
    /// **Warning**: scans every shard.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let now = self.now_millis();
        let mut result = Vec::new();
        for shard in &self.shards {
            let state = shard.state.read();
            result.extend(
                state
                    .entries
                    .iter()
                    .filter(|(key, entry)| !entry.is_expired_at(now) && glob_match(pattern, key))
                    .map(|(key, _)| key.clone()),
            );
        }
        result
    }

    /// Number of resident entries, including expired ones not yet reaped.
    pub fn len(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.state.read().entries.len() as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry for `key` is physically present, ignoring its deadline.
    ///
    /// Unlike [`Store::exists`] this never expires anything.
    pub fn is_resident(&self, key: &[u8]) -> bool {
        self.shard(key).state.read().entries.contains_key(key)
    }

    /// Returns store statistics.
    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats {
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired_lazy: self.expired_lazy.load(Ordering::Relaxed),
            expired_active: self.expired_active.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            ..Default::default()
        };
        for shard in &self.shards {
            let state = shard.state.read();
            stats.keys += state.entries.len() as u64;
            stats.expiring_keys +=
                state.entries.values().filter(|e| e.expires_at.is_some()).count() as u64;
            stats.pending_expiries += state.expiry.len() as u64;
        }
        stats
    }

    // ========================================================================
    // ACTIVE EXPIRATION
    // ========================================================================

    /// Pops due heap records and deletes the keys that are really due.
    ///
    /// Each shard is locked on its own and at most `cap` records are popped per
    /// shard, which bounds every critical section to O(cap log n). A popped key
    /// is only deleted if the store's own deadline for it has also passed; a
    /// key re-set with a later or no deadline just costs a stale record.
    pub fn reap_due(&self, cap: usize) -> ReapReport {
        let now = self.now_millis();
        let mut report = ReapReport::default();

        for shard in &self.shards {
            {
                let state = shard.state.read();
                if state.expiry.peek_due(now).is_none() {
                    report.next_deadline = min_deadline(report.next_deadline, state.expiry.next_deadline());
                    continue;
                }
            }

            let mut state = shard.state.write();
            let mut popped = 0;
            while popped < cap {
                let Some(key) = state.expiry.pop_due(now) else {
                    break;
                };
                popped += 1;
                if state.expire_if_due(&key, now) {
                    report.expired += 1;
                } else {
                    report.stale += 1;
                }
            }

            if state.expiry.peek_due(now).is_some() {
                report.saturated = true;
            }
            report.next_deadline = min_deadline(report.next_deadline, state.expiry.next_deadline());
        }

        self.expired_active.fetch_add(report.expired, Ordering::Relaxed);
        self.stale_skipped.fetch_add(report.stale, Ordering::Relaxed);
        report
    }

    /// Smallest deadline across all expiry heaps, stale records included.
    pub fn next_deadline(&self) -> Option<u64> {
        self.shards
            .iter()
            .map(|s| s.state.read().expiry.next_deadline())
            .fold(None, min_deadline)
    }

    /// Records when the sweeper plans to wake, so earlier deadlines can wake it.
    pub(crate) fn plan_wakeup(&self, at: u64) {
        self.planned_wakeup.store(at, Ordering::SeqCst);
    }

    /// Resolves when a deadline earlier than the planned wake-up is scheduled.
    pub(crate) fn earlier_deadline_scheduled(&self) -> Notified<'_> {
        self.expiry_wakeup.notified()
    }

    fn wake_sweeper_if_earlier(&self, deadline: u64) {
        if deadline < self.planned_wakeup.load(Ordering::SeqCst) {
            self.expiry_wakeup.notify_one();
        }
    }

    // ========================================================================
    // SNAPSHOT SUPPORT
    // ========================================================================

    /// Copies every live entry under all shard read locks at once.
    ///
    /// The locks are released before this returns, so callers can serialize
    /// the copy without blocking writers.
    pub fn snapshot(&self) -> Snapshot {
        let guards: Vec<_> = self.shards.iter().map(|s| s.state.read()).collect();
        let now = self.now_millis();

        let entries = guards
            .iter()
            .flat_map(|state| state.entries.iter())
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        Snapshot {
            taken_at: now,
            entries,
        }
    }

    /// Inserts previously saved entries, rebuilding the expiry index.
    ///
    /// Entries whose deadline has already passed are dropped instead of
    /// inserted. Existing keys with the same name are replaced.
    pub fn restore(&self, entries: impl IntoIterator<Item = (Bytes, Entry)>) -> RestoreReport {
        let now = self.now_millis();
        let mut report = RestoreReport::default();

        for (key, entry) in entries {
            if entry.is_expired_at(now) {
                report.dropped += 1;
                continue;
            }

            let deadline = entry.expires_at;
            {
                let mut state = self.shard(&key).state.write();
                if let Some(at) = deadline {
                    state.expiry.schedule(at, key.clone());
                }
                state.entries.insert(key, entry);
            }
            if let Some(at) = deadline {
                self.wake_sweeper_if_earlier(at);
            }
            report.loaded += 1;
        }

        report
    }
}

fn min_deadline(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

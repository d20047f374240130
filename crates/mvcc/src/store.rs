//! Sharded MVCC store
//!
//! Keys are spread over a fixed number of shards, each behind its own mutex,
//! so requests on unrelated keys do not contend. A shard is only held for the
//! duration of a single key (or a single batch on that shard); nobody ever
//! waits for a lock while holding a shard.

use crate::error::{Error, Result};
use crate::lock::{LockInfo, LockOutcome, LockSnapshot, LockState, LockWait, ReadOutcome};
use crate::version::{CommittedVersion, VersionChain, Write};
use parking_lot::Mutex;
use pessimist_common::{Key, Row, Timestamp, TxnId};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

const DEFAULT_SHARDS: usize = 16;

/// A lock together with the holder's pending write and parked waiters
struct HeldLock {
    info: LockInfo,
    pending: Option<Write>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl HeldLock {
    fn wake_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[derive(Default)]
struct KeyEntry {
    versions: VersionChain,
    lock: Option<HeldLock>,
}

impl KeyEntry {
    fn is_vacant(&self) -> bool {
        self.lock.is_none() && self.versions.is_empty()
    }
}

fn latest_row(versions: &VersionChain) -> Option<Row> {
    versions.latest().and_then(|v| v.write.row().cloned())
}

#[derive(Default)]
struct Shard {
    keys: BTreeMap<Key, KeyEntry>,
}

impl Shard {
    /// Release `txn`'s lock on `key`, if it holds one
    fn release(&mut self, key: &Key, txn: TxnId) -> Option<HeldLock> {
        let entry = self.keys.get_mut(key)?;
        if entry.lock.as_ref().is_none_or(|l| l.info.holder != txn) {
            return None;
        }
        let mut lock = entry.lock.take()?;
        lock.wake_waiters();
        if entry.is_vacant() {
            self.keys.remove(key);
        }
        Some(lock)
    }
}

/// Multi-version store with a pessimistic lock table
pub struct MvccStore {
    shards: Vec<Mutex<Shard>>,
    lock_ttl: Option<Duration>,
    next_seq: AtomicU64,
}

impl MvccStore {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_SHARDS, None)
    }

    /// Create a store with `shards` lock-table buckets and an optional TTL
    /// for pessimistic locks
    pub fn with_config(shards: usize, lock_ttl: Option<Duration>) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            lock_ttl,
            next_seq: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &Key) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &Key) -> &Mutex<Shard> {
        &self.shards[self.shard_index(key)]
    }

    /// Try to lock `key` for `txn`.
    ///
    /// Re-locking a key the transaction already holds succeeds without
    /// changing anything. If another live transaction holds the lock, the
    /// request is parked on it and `Blocked` is returned; the caller waits
    /// on the returned handle and tries again.
    pub fn try_lock(&self, key: &Key, txn: TxnId, for_update_ts: Timestamp) -> LockOutcome {
        let mut shard = self.shard(key).lock();
        let entry = shard.keys.entry(key.clone()).or_default();

        if let Some(lock) = entry.lock.as_mut() {
            if lock.info.holder == txn {
                lock.info.for_update_ts = lock.info.for_update_ts.max(for_update_ts);
                let value = match &lock.pending {
                    Some(write) => write.row().cloned(),
                    None => latest_row(&entry.versions),
                };
                return LockOutcome::Locked {
                    value,
                    newly_acquired: false,
                };
            }

            if lock.info.is_expired(Instant::now()) {
                warn!(
                    key = ?key,
                    holder = %lock.info.holder,
                    requester = %txn,
                    "force resolving expired lock"
                );
                lock.wake_waiters();
                entry.lock = None;
            } else {
                let (tx, rx) = oneshot::channel();
                lock.waiters.push(tx);
                trace!(key = ?key, holder = %lock.info.holder, requester = %txn, "lock blocked");
                return LockOutcome::Blocked {
                    holder: lock.info.holder,
                    wait: LockWait::new(rx),
                };
            }
        }

        entry.lock = Some(HeldLock {
            info: LockInfo {
                holder: txn,
                for_update_ts,
                state: LockState::Pessimistic,
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                acquired_at: Instant::now(),
                ttl: self.lock_ttl,
            },
            pending: None,
            waiters: Vec::new(),
        });
        trace!(key = ?key, txn = %txn, "lock acquired");

        LockOutcome::Locked {
            value: latest_row(&entry.versions),
            newly_acquired: true,
        }
    }

    /// Read `key` as seen by transaction `reader` at `read_ts`.
    ///
    /// The reader's own pending write wins. Otherwise the newest version
    /// with `commit_ts <= read_ts` is returned. Pessimistic locks of other
    /// transactions are invisible; a prewritten lock from a transaction that
    /// started at or before `read_ts` blocks, since it may still commit below
    /// `read_ts`.
    pub fn read(&self, key: &Key, reader: TxnId, read_ts: Timestamp) -> ReadOutcome {
        let mut shard = self.shard(key).lock();
        let Some(entry) = shard.keys.get_mut(key) else {
            return ReadOutcome::Ready(None);
        };

        if let Some(lock) = entry.lock.as_mut() {
            if lock.info.holder == reader {
                if let Some(write) = &lock.pending {
                    return ReadOutcome::Ready(Some(write.clone()));
                }
            } else if lock.info.state == LockState::Prewritten && lock.info.holder <= read_ts {
                let (tx, rx) = oneshot::channel();
                lock.waiters.push(tx);
                trace!(key = ?key, holder = %lock.info.holder, reader = %reader, "read blocked on prewrite");
                return ReadOutcome::Blocked {
                    holder: lock.info.holder,
                    wait: LockWait::new(rx),
                };
            }
        }

        ReadOutcome::Ready(entry.versions.visible_at(read_ts).map(|v| v.write.clone()))
    }

    /// Record `txn`'s pending write on a key it has locked
    pub fn write_pending(&self, key: &Key, txn: TxnId, write: Write) -> Result<()> {
        let mut shard = self.shard(key).lock();
        let lock = shard
            .keys
            .get_mut(key)
            .and_then(|entry| entry.lock.as_mut())
            .filter(|lock| lock.info.holder == txn && lock.info.state == LockState::Pessimistic)
            .ok_or_else(|| Error::LockNotFound {
                key: key.clone(),
                txn,
            })?;
        lock.pending = Some(write);
        Ok(())
    }

    /// Commit timestamp of the newest committed version of `key`
    pub fn latest_commit_ts(&self, key: &Key) -> Option<Timestamp> {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .and_then(|entry| entry.versions.latest())
            .map(|v| v.commit_ts)
    }

    /// First commit phase: mark every lock that carries a pending write as
    /// prewritten.
    ///
    /// Fails with `LockNotFound` if `txn` lost a lock it wrote under. Locks
    /// without a pending write are left alone; commit just releases them.
    pub fn prewrite(&self, txn: TxnId, keys: &[Key]) -> Result<()> {
        for key in keys {
            let mut shard = self.shard(key).lock();
            let lock = shard
                .keys
                .get_mut(key)
                .and_then(|entry| entry.lock.as_mut())
                .filter(|lock| lock.info.holder == txn);

            match lock {
                Some(lock) if lock.pending.is_some() => lock.info.state = LockState::Prewritten,
                Some(_) => {}
                None => {
                    debug!(key = ?key, txn = %txn, "prewrite found no lock");
                    return Err(Error::LockNotFound {
                        key: key.clone(),
                        txn,
                    });
                }
            }
        }
        Ok(())
    }

    /// Second commit phase: promote every pending write of `txn` among
    /// `keys` to a version stamped `commit_ts` and release the locks.
    pub fn commit(&self, txn: TxnId, keys: &[Key], commit_ts: Timestamp) -> Result<()> {
        if commit_ts <= txn {
            return Err(Error::InvalidCommitTs {
                start_ts: txn,
                commit_ts,
            });
        }

        for key in keys {
            let mut shard = self.shard(key).lock();
            let Some(entry) = shard.keys.get_mut(key) else {
                continue;
            };
            if entry.lock.as_ref().is_none_or(|l| l.info.holder != txn) {
                continue;
            }
            let Some(mut lock) = entry.lock.take() else {
                continue;
            };
            if let Some(write) = lock.pending.take() {
                entry.versions.push(CommittedVersion {
                    start_ts: txn,
                    commit_ts,
                    write,
                });
            }
            lock.wake_waiters();
            if entry.is_vacant() {
                shard.keys.remove(key);
            }
        }

        debug!(txn = %txn, commit_ts = %commit_ts, keys = keys.len(), "transaction committed");
        Ok(())
    }

    /// Discard `txn`'s pending writes on `keys` and release its locks.
    ///
    /// Returns how many locks were released. Keys the transaction does not
    /// hold are skipped.
    pub fn rollback(&self, txn: TxnId, keys: &[Key]) -> usize {
        let released = keys
            .iter()
            .filter(|key| self.shard(key).lock().release(key, txn).is_some())
            .count();
        if released > 0 {
            debug!(txn = %txn, released, "locks released");
        }
        released
    }

    /// Current holder of the lock on `key`
    pub fn lock_holder(&self, key: &Key) -> Option<TxnId> {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .and_then(|entry| entry.lock.as_ref())
            .map(|lock| lock.info.holder)
    }

    /// Every live lock, ordered by key
    pub fn locks(&self) -> Vec<LockSnapshot> {
        let mut locks: Vec<LockSnapshot> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .keys
                    .iter()
                    .filter_map(|(key, entry)| {
                        entry.lock.as_ref().map(|lock| LockSnapshot {
                            key: key.clone(),
                            holder: lock.info.holder,
                            state: lock.info.state,
                            has_pending: lock.pending.is_some(),
                            waiters: lock.waiters.iter().filter(|w| !w.is_closed()).count(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        locks
    }

    /// Keys in `[start, end)` that have a committed version or a lock, in
    /// key order. An empty `end` is unbounded.
    pub fn scan_keys(&self, start: &Key, end: &Key) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let shard = shard.lock();
                shard
                    .keys
                    .range(start.clone()..)
                    .take_while(|(key, _)| end.is_empty() || *key < end)
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Number of committed versions of `key`
    pub fn version_count(&self, key: &Key) -> usize {
        self.shard(key)
            .lock()
            .keys
            .get(key)
            .map_or(0, |entry| entry.versions.len())
    }
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new()
    }
}

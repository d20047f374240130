//! Lock records and the outcomes of lock and read requests

use crate::version::Write;
use pessimist_common::{Key, Row, Timestamp, TxnId};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Lifecycle of a held lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Taken by a DML statement or `SELECT ... FOR UPDATE`
    Pessimistic,
    /// Commit has started; the commit timestamp is not yet known
    Prewritten,
}

/// Metadata of a held lock
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub holder: TxnId,
    pub for_update_ts: Timestamp,
    pub state: LockState,
    /// Global acquisition order
    pub seq: u64,
    pub acquired_at: Instant,
    pub ttl: Option<Duration>,
}

impl LockInfo {
    /// Whether the lock may be force-resolved by another transaction
    pub fn is_expired(&self, now: Instant) -> bool {
        match (self.state, self.ttl) {
            (LockState::Pessimistic, Some(ttl)) => now.duration_since(self.acquired_at) >= ttl,
            _ => false,
        }
    }
}

/// Handle a blocked request parks on until the lock it hit is released
#[derive(Debug)]
pub struct LockWait {
    rx: oneshot::Receiver<()>,
}

impl LockWait {
    pub(crate) fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Resolves once the lock is released or force-resolved.
    ///
    /// Release only means the caller should try again; it does not grant
    /// the lock.
    pub async fn released(self) {
        // A dropped sender also means the lock record is gone
        let _ = self.rx.await;
    }
}

/// Result of a lock request
#[derive(Debug)]
pub enum LockOutcome {
    /// The caller holds the lock. `value` is the current row: the caller's
    /// own pending write if it has one, else the newest committed version.
    Locked {
        value: Option<Row>,
        newly_acquired: bool,
    },
    /// Another live transaction holds the lock
    Blocked { holder: TxnId, wait: LockWait },
}

/// Result of a plain read
#[derive(Debug)]
pub enum ReadOutcome {
    /// The visible write, if any. `Write::Delete` is a tombstone.
    Ready(Option<Write>),
    /// A prewritten lock may commit below the read timestamp
    Blocked { holder: TxnId, wait: LockWait },
}

/// Point-in-time view of one lock, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub key: Key,
    pub holder: TxnId,
    pub state: LockState,
    pub has_pending: bool,
    pub waiters: usize,
}

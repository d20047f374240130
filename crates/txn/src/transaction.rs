//! Per-transaction state

use crate::mode::TxnMode;
use crate::statement::Statement;
use pessimist_common::{Key, Timestamp, TxnId};
use pessimist_mvcc::Write;
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed(Timestamp),
    RolledBack,
}

/// State of one transaction, owned by the session running it
#[derive(Debug)]
pub struct TxnContext {
    start_ts: TxnId,
    mode: TxnMode,
    /// Started by `BEGIN` rather than by the first statement
    explicit: bool,
    status: TxnStatus,

    /// Keys locked in the store (pessimistic mode), released at commit or
    /// rollback
    locked_keys: BTreeSet<Key>,

    /// Buffered writes (optimistic mode)
    buffer: BTreeMap<Key, Write>,

    /// Keys read with `FOR UPDATE` in optimistic mode; conflict-checked at
    /// commit
    for_update_keys: BTreeSet<Key>,

    /// Write statements that affected rows (optimistic mode), replayed on
    /// retry
    history: Vec<Statement>,
}

impl TxnContext {
    pub fn new(start_ts: TxnId, mode: TxnMode, explicit: bool) -> Self {
        Self {
            start_ts,
            mode,
            explicit,
            status: TxnStatus::Active,
            locked_keys: BTreeSet::new(),
            buffer: BTreeMap::new(),
            for_update_keys: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    pub fn start_ts(&self) -> TxnId {
        self.start_ts
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn is_pessimistic(&self) -> bool {
        self.mode == TxnMode::Pessimistic
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn locked_keys(&self) -> &BTreeSet<Key> {
        &self.locked_keys
    }

    pub fn add_locked_keys(&mut self, keys: impl IntoIterator<Item = Key>) {
        self.locked_keys.extend(keys);
    }

    pub fn buffer_write(&mut self, key: Key, write: Write) {
        self.buffer.insert(key, write);
    }

    pub fn buffered(&self, key: &Key) -> Option<&Write> {
        self.buffer.get(key)
    }

    pub fn buffered_writes(&self) -> &BTreeMap<Key, Write> {
        &self.buffer
    }

    /// Buffered keys in `[start, end)`
    pub fn buffered_keys_in(&self, start: &Key, end: &Key) -> impl Iterator<Item = &Key> {
        self.buffer
            .range(start.clone()..)
            .map(|(key, _)| key)
            .take_while(move |key| end.is_empty() || *key < end)
    }

    pub fn add_for_update_keys(&mut self, keys: impl IntoIterator<Item = Key>) {
        self.for_update_keys.extend(keys);
    }

    /// Keys an optimistic commit must lock and check for conflicts
    pub fn commit_lock_keys(&self) -> Vec<Key> {
        self.buffer
            .keys()
            .chain(self.for_update_keys.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn record_statement(&mut self, statement: Statement) {
        self.history.push(statement);
    }

    pub fn history(&self) -> &[Statement] {
        &self.history
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn mark_committed(&mut self, commit_ts: Timestamp) {
        self.status = TxnStatus::Committed(commit_ts);
    }

    pub fn mark_rolled_back(&mut self) {
        self.status = TxnStatus::RolledBack;
    }
}

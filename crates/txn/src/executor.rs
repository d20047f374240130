//! Row statement execution inside one transaction
//!
//! Pessimistic statements lock their candidate rows first and evaluate
//! predicates and assignments against the values read under the locks.
//! Optimistic statements work on the start-timestamp snapshot overlaid with
//! the transaction's buffered writes, and defer locking to commit.

use crate::catalog::TableInfo;
use crate::config::Config;
use crate::coordinator::{LockContext, LockCoordinator, StatementLocks};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::statement::{Assignment, Filter, QueryResult, Statement};
use crate::transaction::TxnContext;
use pessimist_common::{Key, Row, Timestamp};
use pessimist_mvcc::Write;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::watch;
use tracing::{debug, info};

/// Keys locked by a statement, with their current values
type LockedValues = BTreeMap<Key, Option<Row>>;

/// Releases a statement's new locks unless they are handed over to the
/// transaction. Covers the statement future being dropped mid-wait.
struct StatementGuard<'a> {
    coordinator: &'a LockCoordinator,
    start_ts: Timestamp,
    locks: StatementLocks,
}

impl<'a> StatementGuard<'a> {
    fn new(coordinator: &'a LockCoordinator, start_ts: Timestamp) -> Self {
        Self {
            coordinator,
            start_ts,
            locks: StatementLocks::default(),
        }
    }

    fn locks(&self) -> &StatementLocks {
        &self.locks
    }

    /// Hand the recorded keys over to the caller
    fn keep(self) -> Vec<Key> {
        self.locks.close()
    }

    fn release(self) -> usize {
        self.coordinator.release_statement(self.start_ts, &self.locks)
    }
}

impl Drop for StatementGuard<'_> {
    fn drop(&mut self) {
        if self.locks.is_closed() {
            return;
        }
        let released = self.coordinator.release_statement(self.start_ts, &self.locks);
        if released > 0 {
            debug!(start_ts = %self.start_ts, released, "dropped statement released its locks");
        }
    }
}

pub(crate) struct Executor<'a> {
    engine: &'a Engine,
    coordinator: &'a LockCoordinator,
    txn: &'a mut TxnContext,
    interrupt: watch::Receiver<bool>,
    config: Config,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        coordinator: &'a LockCoordinator,
        txn: &'a mut TxnContext,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            coordinator,
            txn,
            interrupt,
            config: engine.config(),
        }
    }

    fn lock_context(&self, for_update_ts: Timestamp) -> LockContext {
        LockContext {
            start_ts: self.txn.start_ts(),
            for_update_ts,
            wait_timeout: self.config.lock_wait_timeout(),
            interrupt: self.interrupt.clone(),
        }
    }

    pub(crate) async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        let result = match statement {
            Statement::Insert { table, rows } => {
                let table = self.engine.table(table)?;
                QueryResult::Affected(self.insert(&table, rows).await?)
            }
            Statement::Select {
                table,
                filter,
                for_update,
            } => {
                let table = self.engine.table(table)?;
                let rows = if *for_update {
                    self.select_for_update(&table, filter).await?
                } else {
                    self.select(&table, filter).await?
                };
                QueryResult::Rows(rows)
            }
            Statement::Update {
                table,
                filter,
                assignments,
            } => {
                let table = self.engine.table(table)?;
                QueryResult::Affected(self.update(&table, filter, assignments).await?)
            }
            Statement::Delete { table, filter } => {
                let table = self.engine.table(table)?;
                QueryResult::Affected(self.delete(&table, filter).await?)
            }
            other => {
                return Err(Error::Internal(format!(
                    "{} is not a row statement",
                    other.kind()
                )));
            }
        };

        if !self.txn.is_pessimistic() && statement.is_write() && result.affected() > 0 {
            self.txn.record_statement(statement.clone());
        }
        Ok(result)
    }

    /// Keys a filter may touch: the pinned row, or every row key of the
    /// table known to the store or to the write buffer
    fn candidate_keys(&self, table: &TableInfo, filter: &Filter) -> Vec<Key> {
        if let Some(handle) = filter.point_handle(table) {
            return vec![table.record_key(handle)];
        }
        let (start, end) = table.record_range();
        let mut keys = self.coordinator.store().scan_keys(&start, &end);
        keys.extend(self.txn.buffered_keys_in(&start, &end).cloned());
        keys.sort();
        keys.dedup();
        keys
    }

    /// Rows visible to the transaction: its snapshot overlaid with its own
    /// writes, filtered by the predicate
    async fn visible_rows(&self, table: &TableInfo, filter: &Filter) -> Result<Vec<(Key, Row)>> {
        let keys = self.candidate_keys(table, filter);
        let unbuffered: Vec<Key> = keys
            .iter()
            .filter(|key| self.txn.buffered(key).is_none())
            .cloned()
            .collect();
        let ctx = self.lock_context(self.txn.start_ts());
        let mut snapshot = self.coordinator.read_keys(&ctx, unbuffered).await?;

        let mut rows = Vec::new();
        for key in keys {
            let write = match self.txn.buffered(&key) {
                Some(write) => Some(write.clone()),
                None => snapshot.remove(&key).flatten(),
            };
            let Some(row) = write.and_then(Write::into_row) else {
                continue;
            };
            if filter.matches(table, &row)? {
                rows.push((key, row));
            }
        }
        Ok(rows)
    }

    /// Lock the statement's keys and turn their current values into writes.
    ///
    /// When the statement is chosen as a deadlock victim and the lock its
    /// opponent waits for was taken by this very statement, only the
    /// statement's new locks are released and it starts over with a fresh
    /// for-update timestamp.
    async fn locked_statement<T>(
        &mut self,
        keys: impl Fn(&Self) -> Vec<Key>,
        apply: impl Fn(&LockedValues) -> Result<(T, Vec<(Key, Write)>)>,
    ) -> Result<T> {
        let start_ts = self.txn.start_ts();
        let mut retries = 0;

        loop {
            let ctx = self.lock_context(self.engine.oracle().next());
            let guard = StatementGuard::new(self.coordinator, start_ts);
            let result = self
                .lock_and_apply(&ctx, keys(self), guard.locks(), &apply)
                .await;

            match result {
                Ok(out) => {
                    self.txn.add_locked_keys(guard.keep());
                    return Ok(out);
                }
                Err(Error::Deadlock(info))
                    if retries < self.config.pessimistic_txn.max_retry_count
                        && guard.locks().contains(&info.blocking_key) =>
                {
                    let released = guard.release();
                    retries += 1;
                    self.engine.metrics().statement_retry();
                    info!(
                        start_ts = %start_ts,
                        retry = retries,
                        released,
                        blocking_key = ?info.blocking_key,
                        "statement lost a deadlock on its own lock, retrying"
                    );
                }
                Err(err) => {
                    let released = guard.release();
                    debug!(start_ts = %start_ts, released, error = %err, "statement failed");
                    return Err(err);
                }
            }
        }
    }

    async fn lock_and_apply<T>(
        &self,
        ctx: &LockContext,
        keys: Vec<Key>,
        acquired: &StatementLocks,
        apply: &impl Fn(&LockedValues) -> Result<(T, Vec<(Key, Write)>)>,
    ) -> Result<T> {
        let values = self.coordinator.lock_keys(ctx, keys, acquired).await?;
        let (out, writes) = apply(&values)?;
        for (key, write) in writes {
            self.coordinator.write_pending(ctx.start_ts, &key, write)?;
        }
        Ok(out)
    }

    async fn select(&self, table: &TableInfo, filter: &Filter) -> Result<Vec<Row>> {
        let rows = self.visible_rows(table, filter).await?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    async fn select_for_update(&mut self, table: &TableInfo, filter: &Filter) -> Result<Vec<Row>> {
        if !self.txn.is_pessimistic() {
            let rows = self.visible_rows(table, filter).await?;
            self.txn
                .add_for_update_keys(rows.iter().map(|(key, _)| key.clone()));
            return Ok(rows.into_iter().map(|(_, row)| row).collect());
        }

        self.locked_statement(
            |this| this.candidate_keys(table, filter),
            |values| {
                let mut rows = Vec::new();
                for row in values.values().flatten() {
                    if filter.matches(table, row)? {
                        rows.push(row.clone());
                    }
                }
                Ok((rows, Vec::new()))
            },
        )
        .await
    }

    async fn update(
        &mut self,
        table: &TableInfo,
        filter: &Filter,
        assignments: &[Assignment],
    ) -> Result<u64> {
        let assign = |mut row: Row| -> Result<Row> {
            for assignment in assignments {
                assignment.apply(table, &mut row)?;
            }
            Ok(row)
        };

        if !self.txn.is_pessimistic() {
            let mut writes = Vec::new();
            for (key, row) in self.visible_rows(table, filter).await? {
                writes.push((key, assign(row)?));
            }
            let affected = writes.len() as u64;
            for (key, row) in writes {
                self.txn.buffer_write(key, Write::Put(row));
            }
            return Ok(affected);
        }

        self.locked_statement(
            |this| this.candidate_keys(table, filter),
            |values| {
                let mut writes = Vec::new();
                for (key, row) in values {
                    let Some(row) = row else { continue };
                    if filter.matches(table, row)? {
                        writes.push((key.clone(), Write::Put(assign(row.clone())?)));
                    }
                }
                Ok((writes.len() as u64, writes))
            },
        )
        .await
    }

    async fn delete(&mut self, table: &TableInfo, filter: &Filter) -> Result<u64> {
        if !self.txn.is_pessimistic() {
            let rows = self.visible_rows(table, filter).await?;
            let affected = rows.len() as u64;
            for (key, _) in rows {
                self.txn.buffer_write(key, Write::Delete);
            }
            return Ok(affected);
        }

        self.locked_statement(
            |this| this.candidate_keys(table, filter),
            |values| {
                let mut writes = Vec::new();
                for (key, row) in values {
                    let Some(row) = row else { continue };
                    if filter.matches(table, row)? {
                        writes.push((key.clone(), Write::Delete));
                    }
                }
                Ok((writes.len() as u64, writes))
            },
        )
        .await
    }

    async fn insert(&mut self, table: &TableInfo, rows: &[Row]) -> Result<u64> {
        let mut keyed = Vec::with_capacity(rows.len());
        let mut seen = BTreeSet::new();
        for row in rows {
            let key = table.record_key(table.handle_for(row)?);
            if !seen.insert(key.clone()) {
                return Err(Error::DuplicateKey(key));
            }
            keyed.push((key, row.clone()));
        }

        if !self.txn.is_pessimistic() {
            let unbuffered: Vec<Key> = keyed
                .iter()
                .map(|(key, _)| key.clone())
                .filter(|key| self.txn.buffered(key).is_none())
                .collect();
            let ctx = self.lock_context(self.txn.start_ts());
            let snapshot = self.coordinator.read_keys(&ctx, unbuffered).await?;

            for (key, _) in &keyed {
                let exists = match self.txn.buffered(key) {
                    Some(write) => write.row().is_some(),
                    None => matches!(snapshot.get(key), Some(Some(Write::Put(_)))),
                };
                if exists {
                    return Err(Error::DuplicateKey(key.clone()));
                }
            }
            let affected = keyed.len() as u64;
            for (key, row) in keyed {
                self.txn.buffer_write(key, Write::Put(row));
            }
            return Ok(affected);
        }

        self.locked_statement(
            |_| keyed.iter().map(|(key, _)| key.clone()).collect(),
            |values| {
                let mut writes = Vec::with_capacity(keyed.len());
                for (key, row) in &keyed {
                    if let Some(Some(_)) = values.get(key) {
                        return Err(Error::DuplicateKey(key.clone()));
                    }
                    writes.push((key.clone(), Write::Put(row.clone())));
                }
                Ok((writes.len() as u64, writes))
            },
        )
        .await
    }

    /// Lock one key (pessimistic) or mark it for commit-time conflict
    /// checking (optimistic), and return its current row
    pub(crate) async fn lock_and_read(&mut self, key: Key) -> Result<Option<Row>> {
        if self.txn.is_pessimistic() {
            return self
                .locked_statement(
                    |_| vec![key.clone()],
                    |values| Ok((values.get(&key).cloned().flatten(), Vec::new())),
                )
                .await;
        }

        self.txn.add_for_update_keys([key.clone()]);
        if let Some(write) = self.txn.buffered(&key) {
            return Ok(write.row().cloned());
        }
        let ctx = self.lock_context(self.txn.start_ts());
        let mut values = self.coordinator.read_keys(&ctx, vec![key.clone()]).await?;
        Ok(values.remove(&key).flatten().and_then(Write::into_row))
    }

    /// Two-phase commit of the transaction's locked keys
    pub(crate) async fn commit(&mut self) -> Result<Timestamp> {
        let start_ts = self.txn.start_ts();
        if !self.txn.is_pessimistic() {
            self.lock_buffered_writes().await?;
        }

        let keys: Vec<Key> = self.txn.locked_keys().iter().cloned().collect();
        self.coordinator.prewrite(start_ts, &keys).await?;
        let commit_ts = self.engine.oracle().next();
        self.coordinator.commit(start_ts, &keys, commit_ts).await?;

        self.txn.mark_committed(commit_ts);
        Ok(commit_ts)
    }

    /// Optimistic commit: lock the written and `FOR UPDATE` keys, check them
    /// for conflicting commits, then move the buffer into the store
    async fn lock_buffered_writes(&mut self) -> Result<()> {
        let keys = self.txn.commit_lock_keys();
        if keys.is_empty() {
            return Ok(());
        }

        let start_ts = self.txn.start_ts();
        let ctx = self.lock_context(self.engine.oracle().next());
        let guard = StatementGuard::new(self.coordinator, start_ts);
        let locked = self.coordinator.lock_keys(&ctx, keys.clone(), guard.locks()).await;
        // Whatever was taken is released with the transaction
        self.txn.add_locked_keys(guard.keep());
        locked?;

        self.coordinator.check_write_conflicts(start_ts, &keys)?;
        for (key, write) in self.txn.buffered_writes() {
            self.coordinator
                .write_pending(start_ts, key, write.clone())?;
        }
        Ok(())
    }
}

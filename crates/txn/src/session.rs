//! Client sessions
//!
//! A session holds at most one transaction, the `txn_mode` and `autocommit`
//! session variables and the affected-rows count of the last statement.
//! Statements run one at a time; a running statement can be cancelled from
//! another task through the session's [`InterruptHandle`].

use crate::coordinator::LockCoordinator;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::mode::{TxnMode, resolve_mode};
use crate::statement::{QueryResult, Statement};
use crate::transaction::TxnContext;
use pessimist_common::{Key, Row, Timestamp, TxnId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cancels the statement a session is running
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Abort the current statement. A statement parked on a lock wakes up
    /// with `QueryInterrupted`.
    pub fn interrupt(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.flag.borrow()
    }

    fn reset(&self) {
        self.flag.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

/// One client connection
pub struct Session {
    engine: Engine,
    coordinator: LockCoordinator,
    txn: Option<TxnContext>,
    txn_mode: Option<TxnMode>,
    autocommit: bool,
    affected_rows: u64,
    interrupt: InterruptHandle,
}

impl Session {
    pub(crate) fn new(engine: Engine) -> Self {
        engine.metrics().connection_opened();
        Self {
            coordinator: engine.coordinator(),
            engine,
            txn: None,
            txn_mode: None,
            autocommit: true,
            affected_rows: 0,
            interrupt: InterruptHandle::new(),
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Rows changed (or matched, for `SELECT`) by the last row statement
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Statements recorded for replay by the active transaction
    pub fn history_length(&self) -> usize {
        self.txn.as_ref().map_or(0, TxnContext::history_len)
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn is_pessimistic(&self) -> bool {
        self.txn.as_ref().is_some_and(TxnContext::is_pessimistic)
    }

    pub fn start_ts(&self) -> Option<TxnId> {
        self.txn.as_ref().map(TxnContext::start_ts)
    }

    pub fn txn_mode(&self) -> Option<TxnMode> {
        self.txn_mode
    }

    pub fn set_txn_mode(&mut self, mode: Option<TxnMode>) {
        self.txn_mode = mode;
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Run one statement.
    ///
    /// A deadlock, lock wait timeout, write conflict or interrupt rolls back
    /// the whole transaction; other errors only fail the statement.
    pub async fn execute(&mut self, statement: Statement) -> Result<QueryResult> {
        let kind = statement.kind();
        let started = Instant::now();
        self.interrupt.reset();

        let result = self.dispatch(statement).await;

        let metrics = Arc::clone(self.engine.metrics());
        if let Err(err) = &result {
            metrics.record_error(err);
            if err.is_txn_fatal() && self.txn.is_some() {
                warn!(error = %err, "rolling back transaction");
                self.rollback_current();
            }
        }
        metrics.observe_query(kind, started.elapsed(), result.is_ok());
        result
    }

    async fn dispatch(&mut self, statement: Statement) -> Result<QueryResult> {
        match statement {
            Statement::Begin(mode) => {
                self.begin_transaction(mode).await?;
                Ok(QueryResult::Empty)
            }
            Statement::Commit => {
                if self.txn.is_some() {
                    self.commit().await?;
                }
                Ok(QueryResult::Empty)
            }
            Statement::Rollback => {
                self.rollback();
                Ok(QueryResult::Empty)
            }
            Statement::SetTxnMode(value) => {
                self.txn_mode = TxnMode::parse_session_var(&value)?;
                Ok(QueryResult::Empty)
            }
            Statement::SetAutocommit(on) => {
                if on && !self.autocommit && self.txn.as_ref().is_some_and(|t| !t.is_explicit()) {
                    self.commit().await?;
                }
                self.autocommit = on;
                Ok(QueryResult::Empty)
            }
            Statement::CreateTable {
                name,
                columns,
                primary_key,
                if_not_exists,
            } => {
                // DDL ends the running transaction
                if self.txn.is_some() {
                    self.commit().await?;
                }
                self.engine
                    .catalog()
                    .create(&name, columns, primary_key.as_deref(), if_not_exists)?;
                Ok(QueryResult::Empty)
            }
            statement => self.execute_row_statement(statement).await,
        }
    }

    async fn execute_row_statement(&mut self, statement: Statement) -> Result<QueryResult> {
        self.affected_rows = 0;
        let autocommit = self.txn.is_none() && self.autocommit;
        if self.txn.is_none() {
            self.start_transaction(None, false);
        }

        match self.run_in_txn(&statement).await {
            Ok(result) => {
                self.affected_rows = match &result {
                    QueryResult::Rows(rows) => rows.len() as u64,
                    other => other.affected(),
                };
                if autocommit {
                    self.commit().await?;
                }
                Ok(result)
            }
            Err(err) => {
                if autocommit {
                    self.rollback_current();
                }
                Err(err)
            }
        }
    }

    async fn run_in_txn(&mut self, statement: &Statement) -> Result<QueryResult> {
        let Some(txn) = self.txn.as_mut() else {
            return Err(Error::NoActiveTxn);
        };
        Executor::new(
            &self.engine,
            &self.coordinator,
            txn,
            self.interrupt.subscribe(),
        )
        .execute(statement)
        .await
    }

    /// Start an explicit transaction, committing any active one first.
    /// `mode` is the `BEGIN PESSIMISTIC` / `BEGIN OPTIMISTIC` keyword.
    pub async fn begin_transaction(&mut self, mode: Option<TxnMode>) -> Result<TxnId> {
        if self.txn.is_some() {
            self.commit().await?;
        }
        Ok(self.start_transaction(mode, true))
    }

    fn start_transaction(&mut self, keyword: Option<TxnMode>, explicit: bool) -> TxnId {
        let config = self.engine.config();
        let mode = resolve_mode(&config.pessimistic_txn, keyword, self.txn_mode);
        self.install_txn(mode, explicit)
    }

    fn install_txn(&mut self, mode: TxnMode, explicit: bool) -> TxnId {
        let start_ts = self.engine.oracle().next();
        debug!(start_ts = %start_ts, %mode, explicit, "transaction started");
        self.txn = Some(TxnContext::new(start_ts, mode, explicit));
        start_ts
    }

    /// Lock `key` for the active transaction and return its current row.
    /// Optimistic transactions only remember the key for commit-time
    /// conflict checking.
    pub async fn lock_and_read(&mut self, key: Key) -> Result<Option<Row>> {
        let Some(txn) = self.txn.as_mut() else {
            return Err(Error::NoActiveTxn);
        };
        self.interrupt.reset();
        let result = Executor::new(
            &self.engine,
            &self.coordinator,
            txn,
            self.interrupt.subscribe(),
        )
        .lock_and_read(key)
        .await;

        if let Err(err) = &result
            && err.is_txn_fatal()
        {
            self.rollback_current();
        }
        result
    }

    /// Commit the active transaction.
    ///
    /// An implicit optimistic transaction that loses a write conflict is
    /// retried: its recorded statements are replayed in a fresh transaction,
    /// up to `retry_limit` times. Any failure leaves the session without a
    /// transaction.
    pub async fn commit(&mut self) -> Result<Timestamp> {
        let Some(txn) = self.txn.as_ref() else {
            return Err(Error::NoActiveTxn);
        };
        let retry_limit = if txn.is_explicit() || txn.is_pessimistic() {
            0
        } else {
            self.engine.config().retry_limit
        };
        let mode = txn.mode();
        let history = txn.history().to_vec();

        let mut retries = 0;
        loop {
            match self.commit_once().await {
                Ok(commit_ts) => return Ok(commit_ts),
                Err(Error::WriteConflict { key, .. }) if retries < retry_limit => {
                    retries += 1;
                    self.engine.metrics().statement_retry();
                    info!(
                        retry = retries,
                        key = ?key,
                        statements = history.len(),
                        "write conflict, retrying transaction"
                    );
                    self.rollback_current();
                    self.install_txn(mode, false);
                    for statement in &history {
                        if let Err(err) = self.run_in_txn(statement).await {
                            self.rollback_current();
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    self.rollback_current();
                    return Err(err);
                }
            }
        }
    }

    async fn commit_once(&mut self) -> Result<Timestamp> {
        let Some(txn) = self.txn.as_mut() else {
            return Err(Error::NoActiveTxn);
        };
        let commit_ts = Executor::new(
            &self.engine,
            &self.coordinator,
            txn,
            self.interrupt.subscribe(),
        )
        .commit()
        .await?;

        if let Some(txn) = self.txn.take() {
            debug!(start_ts = %txn.start_ts(), commit_ts = %commit_ts, "transaction committed");
        }
        self.engine.metrics().txn_committed();
        Ok(commit_ts)
    }

    /// Roll back the active transaction, if any
    pub fn rollback(&mut self) {
        self.rollback_current();
    }

    fn rollback_current(&mut self) {
        let Some(mut txn) = self.txn.take() else {
            return;
        };
        let keys: Vec<Key> = txn.locked_keys().iter().cloned().collect();
        let released = self.coordinator.rollback(txn.start_ts(), &keys);
        txn.mark_rolled_back();
        self.engine.metrics().txn_rolled_back();
        debug!(start_ts = %txn.start_ts(), released, "transaction rolled back");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rollback_current();
        self.engine.metrics().connection_closed();
    }
}

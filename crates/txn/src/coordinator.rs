//! Lock coordinator
//!
//! Turns a statement's keys into lock and read requests: keys are grouped
//! by region, each region batch runs as its own task, and every blocked
//! request is registered with the deadlock detector before it parks.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use pessimist_common::{Key, Row, Timestamp, TxnId};
use pessimist_deadlock::{DeadlockDetector, EdgeOutcome};
use pessimist_mvcc::{LockOutcome, MvccStore, ReadOutcome, Write};
use pessimist_router::RegionRouter;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Everything a lock or read request needs to know about its statement
#[derive(Debug, Clone)]
pub struct LockContext {
    pub start_ts: TxnId,
    /// Timestamp of the statement taking the locks
    pub for_update_ts: Timestamp,
    /// Bound on each individual wait
    pub wait_timeout: Duration,
    /// Flips to `true` when the statement is interrupted
    pub interrupt: watch::Receiver<bool>,
}

/// Keys newly locked by the running statement.
///
/// Shared by the statement's region tasks; a key is recorded as soon as its
/// lock is granted. Once closed the set refuses new keys, and a task that
/// gets a lock after that gives it straight back.
#[derive(Debug, Clone, Default)]
pub struct StatementLocks {
    inner: Arc<Mutex<RecordedLocks>>,
}

#[derive(Debug, Default)]
struct RecordedLocks {
    keys: Vec<Key>,
    closed: bool,
}

impl StatementLocks {
    /// Returns `false` if the set is already closed
    fn record(&self, key: Key) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.keys.push(key);
        true
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.lock().keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().keys.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close the set and return every recorded key
    pub fn close(&self) -> Vec<Key> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.keys)
    }
}

/// Resolves once the interrupt flag is set. A closed channel never fires.
async fn interrupted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|&flag| flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Glue between the router, the store and the deadlock detector
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<MvccStore>,
    router: Arc<RegionRouter>,
    detector: Arc<DeadlockDetector>,
    metrics: Arc<Metrics>,
}

impl LockCoordinator {
    pub fn new(
        store: Arc<MvccStore>,
        router: Arc<RegionRouter>,
        detector: Arc<DeadlockDetector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            router,
            detector,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<MvccStore> {
        &self.store
    }

    /// Lock every key, waiting where necessary.
    ///
    /// Returns each key's current value: the transaction's own pending
    /// write if it has one, else the newest committed version. Newly taken
    /// locks are recorded in `acquired` as they are granted, including
    /// when the call fails; the caller decides whether to release them.
    pub async fn lock_keys(
        &self,
        ctx: &LockContext,
        keys: Vec<Key>,
        acquired: &StatementLocks,
    ) -> Result<BTreeMap<Key, Option<Row>>> {
        let task_ctx = ctx.clone();
        let acquired = acquired.clone();
        let values = self
            .fan_out(ctx.start_ts, keys, move |this, key| {
                let ctx = task_ctx.clone();
                let acquired = acquired.clone();
                async move { this.acquire(&ctx, &key, &acquired).await }
            })
            .await?;
        Ok(values.into_iter().collect())
    }

    /// Snapshot-read every key at `ctx.start_ts`
    pub async fn read_keys(
        &self,
        ctx: &LockContext,
        keys: Vec<Key>,
    ) -> Result<BTreeMap<Key, Option<Write>>> {
        let task_ctx = ctx.clone();
        let values = self
            .fan_out(ctx.start_ts, keys, move |this, key| {
                let ctx = task_ctx.clone();
                async move { this.read(&ctx, &key).await }
            })
            .await?;
        Ok(values.into_iter().collect())
    }

    /// Run `per_key` over `keys`, one task per region batch.
    ///
    /// On the first failure the remaining tasks are cancelled and awaited
    /// before the error is returned, so nothing is still running when the
    /// caller cleans up.
    async fn fan_out<T, F, Fut>(
        &self,
        start_ts: TxnId,
        keys: Vec<Key>,
        per_key: F,
    ) -> Result<Vec<(Key, T)>>
    where
        T: Send + 'static,
        F: Fn(LockCoordinator, Key) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for batch in self.router.group_keys_by_region(keys) {
            let this = self.clone();
            let per_key = per_key.clone();
            tasks.spawn(async move {
                this.router
                    .wait_before_request(batch.region, start_ts)
                    .await;
                let mut results = Vec::with_capacity(batch.keys.len());
                for key in batch.keys {
                    let value = per_key(this.clone(), key.clone()).await?;
                    results.push((key, value));
                }
                Ok::<_, Error>(results)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|err| Error::Internal(format!("region task failed: {err}")))
                .and_then(|batch| batch);
            match outcome {
                Ok(batch) => results.extend(batch),
                Err(err) => {
                    tasks.shutdown().await;
                    return Err(err);
                }
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    async fn acquire(
        &self,
        ctx: &LockContext,
        key: &Key,
        acquired: &StatementLocks,
    ) -> Result<Option<Row>> {
        let deadline = Instant::now() + ctx.wait_timeout;
        let mut wait_started: Option<Instant> = None;
        let mut interrupt = ctx.interrupt.clone();

        loop {
            let (holder, wait) = match self.store.try_lock(key, ctx.start_ts, ctx.for_update_ts) {
                LockOutcome::Locked {
                    value,
                    newly_acquired,
                } => {
                    if newly_acquired && !acquired.record(key.clone()) {
                        // The statement is gone; nobody would release this lock
                        self.store.rollback(ctx.start_ts, std::slice::from_ref(key));
                        debug!(start_ts = %ctx.start_ts, key = ?key, "lock granted after statement ended");
                        return Err(Error::QueryInterrupted);
                    }
                    if let Some(started) = wait_started {
                        self.metrics.lock_wait_finished(started.elapsed());
                    }
                    return Ok(value);
                }
                LockOutcome::Blocked { holder, wait } => (holder, wait),
            };

            let guard = match self.detector.register(ctx.start_ts, holder, key.clone()) {
                Ok(guard) => guard,
                Err(err) => {
                    self.metrics.deadlock();
                    return Err(err.into());
                }
            };
            if wait_started.is_none() {
                wait_started = Some(Instant::now());
                self.metrics.lock_wait_started();
            }
            debug!(start_ts = %ctx.start_ts, key = ?key, holder = %holder, "waiting for lock");

            tokio::select! {
                _ = wait.released() => guard.finish(EdgeOutcome::Granted),
                _ = tokio::time::sleep_until(deadline) => {
                    guard.finish(EdgeOutcome::Abandoned);
                    warn!(start_ts = %ctx.start_ts, key = ?key, holder = %holder, "lock wait timeout");
                    return Err(Error::LockWaitTimeout { key: key.clone() });
                }
                _ = interrupted(&mut interrupt) => {
                    guard.finish(EdgeOutcome::Abandoned);
                    debug!(start_ts = %ctx.start_ts, key = ?key, "lock wait interrupted");
                    return Err(Error::QueryInterrupted);
                }
            }
        }
    }

    async fn read(&self, ctx: &LockContext, key: &Key) -> Result<Option<Write>> {
        let deadline = Instant::now() + ctx.wait_timeout;
        let mut interrupt = ctx.interrupt.clone();

        loop {
            let (holder, wait) = match self.store.read(key, ctx.start_ts, ctx.start_ts) {
                ReadOutcome::Ready(write) => return Ok(write),
                ReadOutcome::Blocked { holder, wait } => (holder, wait),
            };
            trace!(start_ts = %ctx.start_ts, key = ?key, holder = %holder, "read waiting for commit");

            tokio::select! {
                _ = wait.released() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::LockWaitTimeout { key: key.clone() });
                }
                _ = interrupted(&mut interrupt) => return Err(Error::QueryInterrupted),
            }
        }
    }

    /// Record a pending write under a lock the transaction holds
    pub fn write_pending(&self, start_ts: TxnId, key: &Key, write: Write) -> Result<()> {
        Ok(self.store.write_pending(key, start_ts, write)?)
    }

    /// Fail with `WriteConflict` if any key has a version committed after
    /// `start_ts`
    pub fn check_write_conflicts(&self, start_ts: TxnId, keys: &[Key]) -> Result<()> {
        for key in keys {
            if let Some(commit_ts) = self.store.latest_commit_ts(key)
                && commit_ts > start_ts
            {
                return Err(Error::WriteConflict {
                    key: key.clone(),
                    start_ts,
                    conflict_commit_ts: commit_ts,
                });
            }
        }
        Ok(())
    }

    /// First commit phase, region by region
    pub async fn prewrite(&self, start_ts: TxnId, keys: &[Key]) -> Result<()> {
        for batch in self.router.group_keys_by_region(keys.iter().cloned()) {
            self.router
                .wait_before_request(batch.region, start_ts)
                .await;
            self.store.prewrite(start_ts, &batch.keys)?;
        }
        Ok(())
    }

    /// Second commit phase, region by region
    pub async fn commit(&self, start_ts: TxnId, keys: &[Key], commit_ts: Timestamp) -> Result<()> {
        for batch in self.router.group_keys_by_region(keys.iter().cloned()) {
            self.router
                .wait_before_request(batch.region, start_ts)
                .await;
            self.store.commit(start_ts, &batch.keys, commit_ts)?;
        }
        self.detector.clean_up(start_ts);
        Ok(())
    }

    /// Release every lock of a finished transaction
    pub fn rollback(&self, start_ts: TxnId, keys: &[Key]) -> usize {
        let released = self.store.rollback(start_ts, keys);
        self.detector.clean_up(start_ts);
        released
    }

    /// Release the locks a failed statement took, keeping the rest of the
    /// transaction's locks. Waiters parked on those locks lose their wait
    /// edges here, since the transaction itself stays alive.
    pub fn release_statement(&self, start_ts: TxnId, acquired: &StatementLocks) -> usize {
        let keys = acquired.close();
        let released = self.store.rollback(start_ts, &keys);
        self.detector.release_keys(start_ts, &keys);
        released
    }
}

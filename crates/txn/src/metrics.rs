//! In-process metrics sink
//!
//! Counters are plain atomics; labelled counters sit behind a mutex since
//! their label sets are small and open-ended. `snapshot()` produces a
//! serializable copy for inspection and export.

use crate::error::Error;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Number of query duration buckets
pub const QUERY_DURATION_BUCKETS: usize = 22;

/// Upper bound of the first query duration bucket, in seconds
const QUERY_DURATION_START: f64 = 0.0005;

/// `count` bucket bounds starting at `start`, each `factor` times the last
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |bound| Some(bound * factor))
        .take(count)
        .collect()
}

/// Histogram over fixed upper bounds, with per-bucket (not cumulative) counts
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// One slot per bound plus the overflow bucket
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let slot = self.bounds.partition_point(|bound| *bound < seconds);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect();
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            count: counts.iter().sum(),
            counts,
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    /// Per-bucket counts; the last entry is the overflow bucket
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum_seconds: f64,
}

/// Metrics of one engine
#[derive(Debug)]
pub struct Metrics {
    query_duration: Histogram,
    query_total: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
    execute_errors: Mutex<BTreeMap<String, u64>>,
    connections: AtomicI64,
    lock_wait_total: AtomicU64,
    lock_wait_micros: AtomicU64,
    deadlock_total: AtomicU64,
    statement_retry_total: AtomicU64,
    txn_commit_total: AtomicU64,
    txn_rollback_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            query_duration: Histogram::new(exponential_buckets(
                QUERY_DURATION_START,
                2.0,
                QUERY_DURATION_BUCKETS,
            )),
            query_total: Mutex::new(BTreeMap::new()),
            execute_errors: Mutex::new(BTreeMap::new()),
            connections: AtomicI64::new(0),
            lock_wait_total: AtomicU64::new(0),
            lock_wait_micros: AtomicU64::new(0),
            deadlock_total: AtomicU64::new(0),
            statement_retry_total: AtomicU64::new(0),
            txn_commit_total: AtomicU64::new(0),
            txn_rollback_total: AtomicU64::new(0),
        }
    }

    /// Record a finished statement of the given kind
    pub fn observe_query(&self, kind: &str, elapsed: Duration, ok: bool) {
        self.query_duration.observe(elapsed);
        let result = if ok { "OK" } else { "Error" };
        *self
            .query_total
            .lock()
            .entry(kind.to_string())
            .or_default()
            .entry(result.to_string())
            .or_default() += 1;
    }

    pub fn record_error(&self, err: &Error) {
        *self
            .execute_errors
            .lock()
            .entry(err.code().label())
            .or_default() += 1;
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// A lock request started waiting
    pub fn lock_wait_started(&self) {
        self.lock_wait_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A lock request finished waiting after `waited`
    pub fn lock_wait_finished(&self, waited: Duration) {
        self.lock_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn deadlock(&self) {
        self.deadlock_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statement_retry(&self) {
        self.statement_retry_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn txn_committed(&self) {
        self.txn_commit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn txn_rolled_back(&self) {
        self.txn_rollback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handle_query_duration_seconds: self.query_duration.snapshot(),
            query_total: self.query_total.lock().clone(),
            execute_error_total: self.execute_errors.lock().clone(),
            connections: self.connections.load(Ordering::Relaxed),
            lock_wait_total: self.lock_wait_total.load(Ordering::Relaxed),
            lock_wait_duration_seconds: self.lock_wait_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
            deadlock_total: self.deadlock_total.load(Ordering::Relaxed),
            statement_retry_total: self.statement_retry_total.load(Ordering::Relaxed),
            txn_commit_total: self.txn_commit_total.load(Ordering::Relaxed),
            txn_rollback_total: self.txn_rollback_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub handle_query_duration_seconds: HistogramSnapshot,
    /// statement kind -> result -> count
    pub query_total: BTreeMap<String, BTreeMap<String, u64>>,
    /// error label -> count
    pub execute_error_total: BTreeMap<String, u64>,
    pub connections: i64,
    pub lock_wait_total: u64,
    pub lock_wait_duration_seconds: f64,
    pub deadlock_total: u64,
    pub statement_retry_total: u64,
    pub txn_commit_total: u64,
    pub txn_rollback_total: u64,
}

impl MetricsSnapshot {
    /// Count of statements of `kind` that ended with `result` (`OK`/`Error`)
    pub fn queries(&self, kind: &str, result: &str) -> u64 {
        self.query_total
            .get(kind)
            .and_then(|results| results.get(result))
            .copied()
            .unwrap_or(0)
    }

    /// Count of errors with the given label
    pub fn errors(&self, label: &str) -> u64 {
        self.execute_error_total.get(label).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

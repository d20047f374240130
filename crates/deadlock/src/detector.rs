//! Deadlock detector

use crate::error::{DeadlockInfo, Error, Result};
use parking_lot::Mutex;
use pessimist_common::{Key, TxnId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// How a wait edge left the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// The lock was granted
    Granted,
    /// The waiter was aborted
    Aborted,
    /// The waiter gave up (timeout, interrupt, cancelled statement)
    Abandoned,
}

/// Counters of finished edges, by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeStats {
    pub granted: u64,
    pub aborted: u64,
    pub abandoned: u64,
}

#[derive(Debug, Clone)]
struct Edge {
    id: u64,
    holder: TxnId,
    key: Key,
}

/// Outgoing edges per waiting transaction
#[derive(Default)]
struct WaitForGraph {
    edges: HashMap<TxnId, Vec<Edge>>,
}

impl WaitForGraph {
    /// Search for a path `holder ->* waiter`. Returns the transactions on
    /// the path (starting at `holder`) and the key of the edge that enters
    /// `waiter`.
    fn find_path(&self, holder: TxnId, waiter: TxnId) -> Option<(Vec<TxnId>, Key)> {
        let mut parents: HashMap<TxnId, TxnId> = HashMap::new();
        let mut visited = HashSet::from([holder]);
        let mut queue = VecDeque::from([holder]);

        while let Some(node) = queue.pop_front() {
            let Some(edges) = self.edges.get(&node) else {
                continue;
            };
            for edge in edges {
                if edge.holder == waiter {
                    let mut path = vec![node];
                    let mut current = node;
                    while let Some(&parent) = parents.get(&current) {
                        path.push(parent);
                        current = parent;
                    }
                    path.reverse();
                    return Some((path, edge.key.clone()));
                }
                if visited.insert(edge.holder) {
                    parents.insert(edge.holder, node);
                    queue.push_back(edge.holder);
                }
            }
        }
        None
    }

    fn remove(&mut self, waiter: TxnId, id: u64) -> bool {
        let Some(edges) = self.edges.get_mut(&waiter) else {
            return false;
        };
        let before = edges.len();
        edges.retain(|edge| edge.id != id);
        let removed = edges.len() != before;
        if edges.is_empty() {
            self.edges.remove(&waiter);
        }
        removed
    }
}

/// Wait-for graph shared by every session
#[derive(Default)]
pub struct DeadlockDetector {
    graph: Mutex<WaitForGraph>,
    next_edge: AtomicU64,
    granted: AtomicU64,
    aborted: AtomicU64,
    abandoned: AtomicU64,
}

impl DeadlockDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that `waiter` is parked on `holder`'s lock on `key`.
    ///
    /// If the new edge would close a cycle it is not inserted and
    /// `Error::Deadlock` names `waiter` as the victim. Otherwise the edge
    /// lives until the returned guard is finished or dropped.
    pub fn register(self: &Arc<Self>, waiter: TxnId, holder: TxnId, key: Key) -> Result<WaitGuard> {
        let mut graph = self.graph.lock();
        let cycle = graph.find_path(holder, waiter);

        if let Some((path, blocking_key)) = cycle {
            drop(graph);
            self.aborted.fetch_add(1, Ordering::Relaxed);

            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(waiter);
            cycle.extend(path);
            let info = DeadlockInfo {
                victim: waiter,
                cycle,
                wait_key: key,
                blocking_key,
            };
            warn!(
                victim = %info.victim,
                holder = %holder,
                wait_key = ?info.wait_key,
                blocking_key = ?info.blocking_key,
                "deadlock detected"
            );
            return Err(Error::Deadlock(Box::new(info)));
        }

        let id = self.next_edge.fetch_add(1, Ordering::Relaxed);
        trace!(waiter = %waiter, holder = %holder, key = ?key, edge = id, "wait edge added");
        graph.edges.entry(waiter).or_default().push(Edge { id, holder, key });

        Ok(WaitGuard {
            detector: Arc::clone(self),
            waiter,
            edge: id,
            outcome: EdgeOutcome::Abandoned,
        })
    }

    fn finish_edge(&self, waiter: TxnId, id: u64, outcome: EdgeOutcome) {
        if !self.graph.lock().remove(waiter, id) {
            return;
        }
        let counter = match outcome {
            EdgeOutcome::Granted => &self.granted,
            EdgeOutcome::Aborted => &self.aborted,
            EdgeOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(waiter = %waiter, edge = id, ?outcome, "wait edge removed");
    }

    /// Drop every edge that starts or ends at a terminated transaction
    pub fn clean_up(&self, txn: TxnId) {
        let mut graph = self.graph.lock();
        let mut removed = graph.edges.remove(&txn).map_or(0, |edges| edges.len());
        graph.edges.retain(|_, edges| {
            let before = edges.len();
            edges.retain(|edge| edge.holder != txn);
            removed += before - edges.len();
            !edges.is_empty()
        });
        drop(graph);

        if removed > 0 {
            self.abandoned.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(txn = %txn, removed, "wait edges cleaned up");
        }
    }

    /// Drop the edges parked on `holder`'s locks on `keys`, after those
    /// locks were released while `holder` itself keeps running. The woken
    /// waiters register again if they still have to wait.
    pub fn release_keys(&self, holder: TxnId, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        let mut graph = self.graph.lock();
        let mut removed = 0;
        graph.edges.retain(|_, edges| {
            let before = edges.len();
            edges.retain(|edge| edge.holder != holder || !keys.contains(&edge.key));
            removed += before - edges.len();
            !edges.is_empty()
        });
        drop(graph);

        if removed > 0 {
            self.abandoned.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(holder = %holder, removed, "wait edges on released locks dropped");
        }
    }

    /// Number of live wait edges
    pub fn edge_count(&self) -> usize {
        self.graph.lock().edges.values().map(Vec::len).sum()
    }

    /// Transactions and keys `txn` is currently waiting on
    pub fn waiting_on(&self, txn: TxnId) -> Vec<(TxnId, Key)> {
        self.graph
            .lock()
            .edges
            .get(&txn)
            .map(|edges| edges.iter().map(|e| (e.holder, e.key.clone())).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> EdgeStats {
        EdgeStats {
            granted: self.granted.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// A registered wait edge. Dropping the guard without finishing it marks
/// the edge abandoned.
pub struct WaitGuard {
    detector: Arc<DeadlockDetector>,
    waiter: TxnId,
    edge: u64,
    outcome: EdgeOutcome,
}

impl WaitGuard {
    /// Remove the edge with the given outcome
    pub fn finish(mut self, outcome: EdgeOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.detector
            .finish_edge(self.waiter, self.edge, self.outcome);
    }
}

//! Shared engine state
//!
//! An `Engine` owns the components every session works against: the
//! timestamp oracle, the region router, the MVCC store, the deadlock
//! detector, the catalog and the metrics sink. It is cheap to clone; clones
//! share the same state.

use crate::catalog::{Catalog, TableInfo};
use crate::config::Config;
use crate::coordinator::LockCoordinator;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::session::Session;
use parking_lot::RwLock;
use pessimist_deadlock::DeadlockDetector;
use pessimist_mvcc::MvccStore;
use pessimist_router::RegionRouter;
use pessimist_tso::TimestampOracle;
use std::sync::Arc;
use tracing::info;

struct Shared {
    config: RwLock<Config>,
    oracle: Arc<TimestampOracle>,
    router: Arc<RegionRouter>,
    store: Arc<MvccStore>,
    detector: Arc<DeadlockDetector>,
    catalog: Catalog,
    metrics: Arc<Metrics>,
}

/// Handle to one transaction engine
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Create an engine. The store layout (shards, lock TTL) is fixed from
    /// `config` at this point; the rest can change later.
    pub fn new(config: Config) -> Self {
        let store = MvccStore::with_config(config.store_shards, config.lock_ttl());
        info!(
            pessimistic = config.pessimistic_txn.enable,
            pessimistic_default = config.pessimistic_txn.default,
            shards = config.store_shards,
            "transaction engine started"
        );

        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                oracle: Arc::new(TimestampOracle::new()),
                router: Arc::new(RegionRouter::new()),
                store: Arc::new(store),
                detector: DeadlockDetector::new(),
                catalog: Catalog::new(),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// Current configuration
    pub fn config(&self) -> Config {
        self.shared.config.read().clone()
    }

    /// Change the configuration. Takes effect for transactions started
    /// afterwards.
    pub fn update_config(&self, update: impl FnOnce(&mut Config)) {
        update(&mut self.shared.config.write());
    }

    pub fn oracle(&self) -> &Arc<TimestampOracle> {
        &self.shared.oracle
    }

    pub fn router(&self) -> &Arc<RegionRouter> {
        &self.shared.router
    }

    pub fn store(&self) -> &Arc<MvccStore> {
        &self.shared.store
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.shared.detector
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.shared.catalog.get(name)
    }

    pub fn coordinator(&self) -> LockCoordinator {
        LockCoordinator::new(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.router),
            Arc::clone(&self.shared.detector),
            Arc::clone(&self.shared.metrics),
        )
    }

    /// Open a new session
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

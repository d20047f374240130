//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `[pessimistic_txn]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PessimisticTxnConfig {
    /// When false every transaction is optimistic
    pub enable: bool,

    /// Mode of transactions that name none, when the session doesn't either
    pub default: bool,

    /// How often a statement is retried after losing a deadlock on a lock
    /// it took itself
    pub max_retry_count: usize,

    /// Lock TTL in milliseconds; expired pessimistic locks may be resolved
    /// by other transactions
    pub ttl_ms: Option<u64>,
}

impl Default for PessimisticTxnConfig {
    fn default() -> Self {
        Self {
            enable: true,
            default: false,
            max_retry_count: 256,
            ttl_ms: None,
        }
    }
}

/// Configuration for the transaction engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pessimistic_txn: PessimisticTxnConfig,

    /// Upper bound on a single lock wait, in milliseconds
    pub lock_wait_timeout_ms: u64,

    /// Retries of an implicit optimistic transaction on write conflict
    pub retry_limit: usize,

    /// Number of lock table shards
    pub store_shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pessimistic_txn: PessimisticTxnConfig::default(),
            lock_wait_timeout_ms: 50_000,
            retry_limit: 10,
            store_shards: 16,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        self.pessimistic_txn.ttl_ms.map(Duration::from_millis)
    }

    /// Enable or disable pessimistic transactions
    pub fn with_pessimistic_enabled(mut self, enable: bool) -> Self {
        self.pessimistic_txn.enable = enable;
        self
    }

    /// Set the server-wide default mode
    pub fn with_pessimistic_default(mut self, default: bool) -> Self {
        self.pessimistic_txn.default = default;
        self
    }

    /// Set the statement retry bound for deadlocks
    pub fn with_max_retry_count(mut self, count: usize) -> Self {
        self.pessimistic_txn.max_retry_count = count;
        self
    }

    /// Set the lock TTL
    pub fn with_lock_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.pessimistic_txn.ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64);
        self
    }

    /// Set the lock wait timeout
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the optimistic retry limit
    pub fn with_retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the lock table shard count
    pub fn with_store_shards(mut self, shards: usize) -> Self {
        self.store_shards = shards;
        self
    }
}

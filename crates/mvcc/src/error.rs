//! Error types for the MVCC store

use pessimist_common::{Key, Timestamp, TxnId};
use thiserror::Error;

/// Result type for MVCC operations
pub type Result<T> = std::result::Result<T, Error>;

/// MVCC store errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transaction no longer holds the lock it expects on `key`
    #[error("Lock on {key} not held by transaction {txn}")]
    LockNotFound { key: Key, txn: TxnId },

    #[error("Commit timestamp {commit_ts} must exceed start timestamp {start_ts}")]
    InvalidCommitTs {
        start_ts: TxnId,
        commit_ts: Timestamp,
    },
}

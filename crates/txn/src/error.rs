//! Session-facing errors and their client error codes

use pessimist_common::{Key, Timestamp, TxnId};
use pessimist_deadlock::DeadlockInfo;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the session layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Deadlock found when trying to get lock; try restarting transaction ({0})")]
    Deadlock(Box<DeadlockInfo>),

    #[error("Lock wait timeout exceeded on {key}; try restarting transaction")]
    LockWaitTimeout { key: Key },

    #[error("Write conflict on {key}: start_ts {start_ts}, conflicting commit_ts {conflict_commit_ts}")]
    WriteConflict {
        key: Key,
        start_ts: TxnId,
        conflict_commit_ts: Timestamp,
    },

    #[error("Transaction {start_ts} lost its lock on {key}")]
    TxnLockNotFound { key: Key, start_ts: TxnId },

    #[error("Query execution was interrupted")]
    QueryInterrupted,

    #[error("Duplicate entry for key {0}")]
    DuplicateKey(Key),

    #[error("Table '{0}' doesn't exist")]
    TableNotFound(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Unknown column '{0}'")]
    ColumnNotFound(String),

    #[error("Column count doesn't match value count: expected {expected}, got {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    #[error("Incorrect value: {0}")]
    InvalidValue(String),

    #[error("Variable 'txn_mode' can't be set to the value of '{0}'")]
    InvalidTxnMode(String),

    #[error("No active transaction")]
    NoActiveTxn,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Family an error code belongs to, used in metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorClass {
    Txn,
    Executor,
    Schema,
    Variable,
    Server,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Txn => "txn",
            ErrorClass::Executor => "executor",
            ErrorClass::Schema => "schema",
            ErrorClass::Variable => "variable",
            ErrorClass::Server => "server",
        };
        f.write_str(name)
    }
}

/// Client-visible error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ErrorCode {
    pub class: ErrorClass,
    pub code: u16,
}

impl ErrorCode {
    pub const LOCK_DEADLOCK: ErrorCode = ErrorCode::new(ErrorClass::Txn, 1213);
    pub const LOCK_WAIT_TIMEOUT: ErrorCode = ErrorCode::new(ErrorClass::Txn, 1205);
    pub const WRITE_CONFLICT: ErrorCode = ErrorCode::new(ErrorClass::Txn, 9007);
    pub const TXN_LOCK_NOT_FOUND: ErrorCode = ErrorCode::new(ErrorClass::Txn, 8229);
    pub const QUERY_INTERRUPTED: ErrorCode = ErrorCode::new(ErrorClass::Executor, 1317);
    pub const DUPLICATE_KEY: ErrorCode = ErrorCode::new(ErrorClass::Executor, 1062);
    pub const TABLE_NOT_FOUND: ErrorCode = ErrorCode::new(ErrorClass::Schema, 1146);
    pub const TABLE_EXISTS: ErrorCode = ErrorCode::new(ErrorClass::Schema, 1050);
    pub const COLUMN_NOT_FOUND: ErrorCode = ErrorCode::new(ErrorClass::Schema, 1054);
    pub const COLUMN_COUNT_MISMATCH: ErrorCode = ErrorCode::new(ErrorClass::Executor, 1136);
    pub const INVALID_VALUE: ErrorCode = ErrorCode::new(ErrorClass::Executor, 1292);
    pub const INVALID_TXN_MODE: ErrorCode = ErrorCode::new(ErrorClass::Variable, 1231);
    pub const NO_ACTIVE_TXN: ErrorCode = ErrorCode::new(ErrorClass::Txn, 8005);
    pub const UNKNOWN: ErrorCode = ErrorCode::new(ErrorClass::Server, 1105);

    pub const fn new(class: ErrorClass, code: u16) -> Self {
        Self { class, code }
    }

    /// `"<class>:<code>"`, the label used by the error counters.
    /// Errors without a specific code are labelled `unknown`.
    pub fn label(&self) -> String {
        if *self == ErrorCode::UNKNOWN {
            return "unknown".to_string();
        }
        format!("{}:{}", self.class, self.code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl Error {
    /// Map to the code reported to clients
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Deadlock(_) => ErrorCode::LOCK_DEADLOCK,
            Error::LockWaitTimeout { .. } => ErrorCode::LOCK_WAIT_TIMEOUT,
            Error::WriteConflict { .. } => ErrorCode::WRITE_CONFLICT,
            Error::TxnLockNotFound { .. } => ErrorCode::TXN_LOCK_NOT_FOUND,
            Error::QueryInterrupted => ErrorCode::QUERY_INTERRUPTED,
            Error::DuplicateKey(_) => ErrorCode::DUPLICATE_KEY,
            Error::TableNotFound(_) => ErrorCode::TABLE_NOT_FOUND,
            Error::TableExists(_) => ErrorCode::TABLE_EXISTS,
            Error::ColumnNotFound(_) => ErrorCode::COLUMN_NOT_FOUND,
            Error::ColumnCountMismatch { .. } => ErrorCode::COLUMN_COUNT_MISMATCH,
            Error::InvalidValue(_) => ErrorCode::INVALID_VALUE,
            Error::InvalidTxnMode(_) => ErrorCode::INVALID_TXN_MODE,
            Error::NoActiveTxn => ErrorCode::NO_ACTIVE_TXN,
            Error::Internal(_) => ErrorCode::UNKNOWN,
        }
    }

    /// Whether the whole transaction must be rolled back
    pub fn is_txn_fatal(&self) -> bool {
        matches!(
            self,
            Error::Deadlock(_)
                | Error::LockWaitTimeout { .. }
                | Error::WriteConflict { .. }
                | Error::TxnLockNotFound { .. }
                | Error::QueryInterrupted
        )
    }
}

impl From<pessimist_mvcc::Error> for Error {
    fn from(err: pessimist_mvcc::Error) -> Self {
        match err {
            pessimist_mvcc::Error::LockNotFound { key, txn } => Error::TxnLockNotFound {
                key,
                start_ts: txn,
            },
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<pessimist_deadlock::Error> for Error {
    fn from(err: pessimist_deadlock::Error) -> Self {
        match err {
            pessimist_deadlock::Error::Deadlock(info) => Error::Deadlock(info),
        }
    }
}

impl From<pessimist_router::Error> for Error {
    fn from(err: pessimist_router::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let deadlock = Error::Deadlock(Box::new(DeadlockInfo {
            victim: Timestamp::new(2),
            cycle: vec![Timestamp::new(2), Timestamp::new(1)],
            wait_key: Key::record(1, 2),
            blocking_key: Key::record(1, 1),
        }));
        assert_eq!(deadlock.code().code, 1213);
        assert_eq!(deadlock.code().label(), "txn:1213");
        assert_eq!(Error::QueryInterrupted.code().label(), "executor:1317");
        assert_eq!(Error::Internal("x".into()).code(), ErrorCode::UNKNOWN);
        assert_eq!(ErrorCode::UNKNOWN.label(), "unknown");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::QueryInterrupted.is_txn_fatal());
        assert!(
            Error::LockWaitTimeout {
                key: Key::from("k")
            }
            .is_txn_fatal()
        );
        assert!(!Error::DuplicateKey(Key::from("k")).is_txn_fatal());
        assert!(!Error::TableNotFound("t".into()).is_txn_fatal());
    }

    #[test]
    fn test_lock_not_found_conversion() {
        let err: Error = pessimist_mvcc::Error::LockNotFound {
            key: Key::from("k"),
            txn: Timestamp::new(7),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::TXN_LOCK_NOT_FOUND);
    }
}

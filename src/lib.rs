//! Pessimistic and optimistic transactions over a sharded MVCC store
//!
//! This crate ties the workspace together:
//! - `tso`: monotonic timestamp oracle
//! - `router`: key-to-region mapping, splits and delay injection
//! - `mvcc`: versioned key store with the per-key lock table
//! - `deadlock`: wait-for graph and deadlock victim selection
//! - `txn`: sessions, transaction contexts and the lock coordinator

pub use pessimist_common as common;
pub use pessimist_deadlock as deadlock;
pub use pessimist_mvcc as mvcc;
pub use pessimist_router as router;
pub use pessimist_tso as tso;
pub use pessimist_txn as txn;

pub use pessimist_common::{Key, Row, Timestamp, TxnId, Value};
pub use pessimist_txn::{
    Assignment, Config, Engine, Error, ErrorCode, Filter, QueryResult, Result, Session, Statement,
    TxnMode,
};

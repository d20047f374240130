//! Transaction layer
//!
//! Sessions run statements inside optimistic or pessimistic transactions
//! over the shared MVCC store. Pessimistic statements lock rows through the
//! [`LockCoordinator`], which fans lock requests out per region and consults
//! the deadlock detector before any request parks.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
mod executor;
pub mod metrics;
pub mod mode;
pub mod session;
pub mod statement;
pub mod transaction;

pub use catalog::{Catalog, TableInfo};
pub use config::{Config, PessimisticTxnConfig};
pub use coordinator::{LockContext, LockCoordinator, StatementLocks};
pub use engine::Engine;
pub use error::{Error, ErrorClass, ErrorCode, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use mode::{TxnMode, resolve_mode};
pub use session::{InterruptHandle, Session};
pub use statement::{Assignment, Filter, QueryResult, Statement};
pub use transaction::{TxnContext, TxnStatus};

//! Multi-version key store with a pessimistic lock table
//!
//! Every key carries a chain of committed versions ordered by commit
//! timestamp and at most one lock. A lock may hold the owning transaction's
//! pending write, which only that transaction can see until commit.
//!
//! Lock acquisition never spins: a conflicting request gets back a
//! [`LockWait`] it can park on, woken when the lock is released.

pub mod error;
pub mod lock;
pub mod store;
pub mod version;

pub use error::{Error, Result};
pub use lock::{LockInfo, LockOutcome, LockSnapshot, LockState, LockWait, ReadOutcome};
pub use store::MvccStore;
pub use version::{CommittedVersion, VersionChain, Write};

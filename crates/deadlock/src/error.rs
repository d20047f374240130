//! Error types for deadlock detection

use pessimist_common::{Key, TxnId};
use std::fmt;
use thiserror::Error;

/// Result type for detector operations
pub type Result<T> = std::result::Result<T, Error>;

/// Description of a detected cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// Transaction that must abort
    pub victim: TxnId,
    /// Transactions on the cycle, starting at the victim
    pub cycle: Vec<TxnId>,
    /// Key the victim tried to lock
    pub wait_key: Key,
    /// Key held by the victim that its predecessor on the cycle waits for
    pub blocking_key: Key,
}

impl fmt::Display for DeadlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "victim {} waiting on {}, cycle [", self.victim, self.wait_key)?;
        for (i, txn) in self.cycle.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{txn}")?;
        }
        write!(f, "]")
    }
}

/// Detector errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Deadlock detected: {0}")]
    Deadlock(Box<DeadlockInfo>),
}

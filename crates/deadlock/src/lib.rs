//! Wait-for graph deadlock detection
//!
//! Nodes are transactions; an edge `A -> B` labelled with a key says A is
//! parked on B's lock on that key. Every new edge is checked for a cycle
//! before it is inserted, and the requester whose edge would close the
//! cycle is the victim.

pub mod detector;
pub mod error;

pub use detector::{DeadlockDetector, EdgeOutcome, EdgeStats, WaitGuard};
pub use error::{DeadlockInfo, Error, Result};

//! Logical timestamps
//!
//! A timestamp packs a physical millisecond clock reading into the high bits
//! and a logical counter into the low [`Timestamp::LOGICAL_BITS`] bits, so the
//! plain `u64` ordering is the total order used for MVCC visibility.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transactions are identified by their start timestamp.
pub type TxnId = Timestamp;

/// Totally ordered logical timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Number of low bits reserved for the logical counter.
    pub const LOGICAL_BITS: u32 = 18;

    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Compose a timestamp from a physical reading and a logical counter.
    pub const fn compose(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << Self::LOGICAL_BITS) + logical)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Physical component in milliseconds since the Unix epoch.
    pub const fn physical_ms(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    /// Logical counter within the physical millisecond.
    pub const fn logical(&self) -> u64 {
        self.0 & ((1 << Self::LOGICAL_BITS) - 1)
    }

    /// The immediately following timestamp.
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Region descriptors

use pessimist_common::Key;
use std::fmt;

/// Region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// A contiguous key range `[start, end)`. An empty `end` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,
    pub start: Key,
    pub end: Key,
}

impl Region {
    /// Check whether `key` falls inside this region
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start && (self.end.is_empty() || *key < self.end)
    }
}

/// Keys of one statement that live in the same region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBatch {
    pub region: RegionId,
    pub keys: Vec<Key>,
}

//! Error types for the region router

use crate::region::RegionId;
use pessimist_common::Key;
use thiserror::Error;

/// Result type for router operations
pub type Result<T> = std::result::Result<T, Error>;

/// Router errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Region not found: {0}")]
    RegionNotFound(RegionId),

    #[error("Invalid split key: {0:?}")]
    InvalidSplitKey(Key),

    #[error("Invalid split count: {0}")]
    InvalidSplitCount(usize),

    #[error("Split points for {approx_row_count} rows in {count} regions exceed the handle range")]
    SplitOutOfRange { approx_row_count: u64, count: usize },
}

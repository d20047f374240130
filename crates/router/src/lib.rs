//! Key-to-region routing
//!
//! The key space is partitioned into contiguous regions. The router answers
//! which region owns a key, splits regions, groups a statement's keys into
//! per-region batches, and carries the delay-injection hook tests use to
//! open race windows on a single region.

pub mod error;
pub mod region;
pub mod router;

pub use error::{Error, Result};
pub use region::{Region, RegionBatch, RegionId};
pub use router::RegionRouter;

//! Common types shared by every layer of the transaction core
//!
//! This crate defines:
//! - Logical timestamps (start, for-update and commit timestamps)
//! - Transaction identifiers (a transaction is named by its start timestamp)
//! - Byte-ordered keys with the table record codec
//! - Row values

mod key;
mod timestamp;
mod value;

pub use key::Key;
pub use timestamp::{Timestamp, TxnId};
pub use value::{Row, Value};

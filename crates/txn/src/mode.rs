//! Transaction mode selection

use crate::config::PessimisticTxnConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concurrency control mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnMode {
    /// Conflicts are detected at commit
    Optimistic,
    /// Rows are locked when touched
    Pessimistic,
}

impl TxnMode {
    /// Parse the `txn_mode` session variable. The empty string clears it.
    pub fn parse_session_var(value: &str) -> Result<Option<TxnMode>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "pessimistic" => Ok(Some(TxnMode::Pessimistic)),
            "optimistic" => Ok(Some(TxnMode::Optimistic)),
            _ => Err(Error::InvalidTxnMode(value.to_string())),
        }
    }
}

impl fmt::Display for TxnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnMode::Optimistic => write!(f, "optimistic"),
            TxnMode::Pessimistic => write!(f, "pessimistic"),
        }
    }
}

/// Pick the mode of a new transaction.
///
/// The statement keyword wins over the session variable, which wins over
/// the configured default. With pessimistic transactions disabled the
/// answer is always optimistic.
pub fn resolve_mode(
    config: &PessimisticTxnConfig,
    keyword: Option<TxnMode>,
    session: Option<TxnMode>,
) -> TxnMode {
    if !config.enable {
        return TxnMode::Optimistic;
    }
    keyword.or(session).unwrap_or(if config.default {
        TxnMode::Pessimistic
    } else {
        TxnMode::Optimistic
    })
}

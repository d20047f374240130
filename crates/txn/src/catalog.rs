//! Table catalog
//!
//! Schema changes are not transactional: a table exists from the moment it
//! is created.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use pessimist_common::{Key, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

/// First id handed to a user table
const FIRST_TABLE_ID: i64 = 100;

/// Schema of one table
#[derive(Debug)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<String>,
    /// Index of the integer primary key column, which doubles as the handle
    pub primary_key: Option<usize>,
    /// Hidden handle allocator for tables without a primary key
    next_row_id: AtomicI64,
}

impl TableInfo {
    pub fn new(id: i64, name: &str, columns: Vec<String>, primary_key: Option<usize>) -> Self {
        Self {
            id,
            name: name.to_string(),
            columns,
            primary_key,
            next_row_id: AtomicI64::new(1),
        }
    }

    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
    }

    /// Validate a row to insert and work out its handle
    pub fn handle_for(&self, row: &Row) -> Result<i64> {
        if row.len() != self.columns.len() {
            return Err(Error::ColumnCountMismatch {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        match self.primary_key {
            Some(pk) => row[pk].as_i64().ok_or_else(|| {
                Error::InvalidValue(format!(
                    "primary key {} must be an integer, got {}",
                    self.columns[pk],
                    row[pk].type_name()
                ))
            }),
            None => Ok(self.next_row_id.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub fn record_key(&self, handle: i64) -> Key {
        Key::record(self.id, handle)
    }

    /// `[start, end)` of this table's row keys
    pub fn record_range(&self) -> (Key, Key) {
        Key::table_record_range(self.id)
    }
}

/// Tables by name
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
    next_id: AtomicI64,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(FIRST_TABLE_ID),
        }
    }

    /// Create a table. With `if_not_exists` an existing table is returned
    /// unchanged.
    pub fn create(
        &self,
        name: &str,
        columns: Vec<String>,
        primary_key: Option<&str>,
        if_not_exists: bool,
    ) -> Result<Arc<TableInfo>> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(name) {
            if if_not_exists {
                return Ok(Arc::clone(existing));
            }
            return Err(Error::TableExists(name.to_string()));
        }

        let primary_key = primary_key
            .map(|pk| {
                columns
                    .iter()
                    .position(|c| c == pk)
                    .ok_or_else(|| Error::ColumnNotFound(pk.to_string()))
            })
            .transpose()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let table = Arc::new(TableInfo::new(id, name, columns, primary_key));
        tables.insert(name.to_string(), Arc::clone(&table));

        info!(table = name, table_id = id, "table created");
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Result<Arc<TableInfo>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

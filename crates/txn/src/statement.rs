//! Planned statements
//!
//! Parsing and planning happen elsewhere; the executor receives statements
//! already resolved to a table, a row filter and assignments.

use crate::catalog::TableInfo;
use crate::error::{Error, Result};
use crate::mode::TxnMode;
use pessimist_common::{Row, Value};

/// Row filter: an optional handle constraint and an optional
/// `column = value` predicate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub handle: Option<i64>,
    pub eq: Option<(String, Value)>,
}

impl Filter {
    /// Every row
    pub fn all() -> Self {
        Self::default()
    }

    /// The row with the given handle
    pub fn handle(handle: i64) -> Self {
        Self {
            handle: Some(handle),
            eq: None,
        }
    }

    /// Rows where `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            handle: None,
            eq: Some((column.into(), value.into())),
        }
    }

    /// Handle the filter pins down, directly or through the primary key
    pub fn point_handle(&self, table: &TableInfo) -> Option<i64> {
        self.handle.or_else(|| {
            let (column, value) = self.eq.as_ref()?;
            let pk = table.primary_key?;
            (table.columns[pk] == *column).then(|| value.as_i64())?
        })
    }

    /// Evaluate the value predicate against a row
    pub fn matches(&self, table: &TableInfo, row: &Row) -> Result<bool> {
        match &self.eq {
            None => Ok(true),
            Some((column, value)) => {
                let index = table.column_index(column)?;
                Ok(row.get(index) == Some(value))
            }
        }
    }
}

/// One `SET` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// `column = value`
    Set(String, Value),
    /// `column = column + delta`
    Add(String, i64),
}

impl Assignment {
    pub fn set(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Assignment::Set(column.into(), value.into())
    }

    pub fn add(column: impl Into<String>, delta: i64) -> Self {
        Assignment::Add(column.into(), delta)
    }

    fn column(&self) -> &str {
        match self {
            Assignment::Set(column, _) | Assignment::Add(column, _) => column,
        }
    }

    /// Apply to `row` in place
    pub fn apply(&self, table: &TableInfo, row: &mut Row) -> Result<()> {
        let index = table.column_index(self.column())?;
        if table.primary_key == Some(index) {
            return Err(Error::InvalidValue(format!(
                "primary key column '{}' cannot be updated",
                self.column()
            )));
        }

        let slot = row
            .get_mut(index)
            .ok_or_else(|| Error::Internal(format!("row has no column {index}")))?;
        *slot = match self {
            Assignment::Set(_, value) => value.clone(),
            Assignment::Add(_, _) if slot.is_null() => Value::Null,
            Assignment::Add(column, delta) => slot.checked_add(*delta).ok_or_else(|| {
                Error::InvalidValue(format!("cannot add {delta} to {column} = {slot}"))
            })?,
        };
        Ok(())
    }
}

/// A statement the session can execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `BEGIN [PESSIMISTIC | OPTIMISTIC]`
    Begin(Option<TxnMode>),
    Commit,
    Rollback,
    /// `SET txn_mode = ...`
    SetTxnMode(String),
    /// `SET autocommit = ...`
    SetAutocommit(bool),
    CreateTable {
        name: String,
        columns: Vec<String>,
        /// Integer primary key column; tables without one get hidden handles
        primary_key: Option<String>,
        if_not_exists: bool,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
    },
    Select {
        table: String,
        filter: Filter,
        for_update: bool,
    },
    Update {
        table: String,
        filter: Filter,
        assignments: Vec<Assignment>,
    },
    Delete {
        table: String,
        filter: Filter,
    },
}

impl Statement {
    pub fn begin() -> Self {
        Statement::Begin(None)
    }

    pub fn begin_pessimistic() -> Self {
        Statement::Begin(Some(TxnMode::Pessimistic))
    }

    pub fn begin_optimistic() -> Self {
        Statement::Begin(Some(TxnMode::Optimistic))
    }

    pub fn create_table(name: &str, columns: &[&str], primary_key: Option<&str>) -> Self {
        Statement::CreateTable {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: primary_key.map(str::to_string),
            if_not_exists: false,
        }
    }

    pub fn insert(table: &str, rows: Vec<Row>) -> Self {
        Statement::Insert {
            table: table.to_string(),
            rows,
        }
    }

    pub fn select(table: &str, filter: Filter) -> Self {
        Statement::Select {
            table: table.to_string(),
            filter,
            for_update: false,
        }
    }

    pub fn select_for_update(table: &str, filter: Filter) -> Self {
        Statement::Select {
            table: table.to_string(),
            filter,
            for_update: true,
        }
    }

    pub fn update(table: &str, filter: Filter, assignments: Vec<Assignment>) -> Self {
        Statement::Update {
            table: table.to_string(),
            filter,
            assignments,
        }
    }

    pub fn delete(table: &str, filter: Filter) -> Self {
        Statement::Delete {
            table: table.to_string(),
            filter,
        }
    }

    /// Statement type label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Begin(_) => "Begin",
            Statement::Commit => "Commit",
            Statement::Rollback => "Rollback",
            Statement::SetTxnMode(_) | Statement::SetAutocommit(_) => "Set",
            Statement::CreateTable { .. } => "CreateTable",
            Statement::Insert { .. } => "Insert",
            Statement::Select {
                for_update: false, ..
            } => "Select",
            Statement::Select {
                for_update: true, ..
            } => "SelectForUpdate",
            Statement::Update { .. } => "Update",
            Statement::Delete { .. } => "Delete",
        }
    }

    /// Reads or writes table rows inside a transaction
    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. }
                | Statement::Select { .. }
                | Statement::Update { .. }
                | Statement::Delete { .. }
        )
    }

    /// Writes rows
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }
}

/// Result of a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Empty,
    Affected(u64),
    Rows(Vec<Row>),
}

impl QueryResult {
    pub fn affected(&self) -> u64 {
        match self {
            QueryResult::Affected(n) => *n,
            _ => 0,
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }
}

//! Relational store interface
//!
//! [`SyncStore`] is everything the loader, the constraint toggler and the
//! backup step need from the database. [`postgres::PgStore`] is the
//! production implementation; tests run against an in-memory fake.

pub mod postgres;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::flatten::{FlatRecord, FlatValue};

pub use postgres::PgStore;

/// SQLSTATE raised when a value is too long for its column
pub const SQLSTATE_STRING_TRUNCATION: &str = "22001";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value too long for a column of {table}: {message}")]
    Truncation { table: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Rejected(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Classify a driver error raised while writing to `table`
    pub fn from_sqlx(table: &QualifiedTable, err: sqlx::Error) -> Self {
        let truncation = match &err {
            sqlx::Error::Database(db) => {
                db.code().as_deref() == Some(SQLSTATE_STRING_TRUNCATION)
                    || db.message().to_lowercase().contains("truncat")
            }
            _ => false,
        };

        if truncation {
            StoreError::Truncation {
                table: table.to_string(),
                message: err.to_string(),
            }
        } else {
            StoreError::Database(err)
        }
    }

    pub fn is_truncation(&self) -> bool {
        match self {
            StoreError::Truncation { .. } => true,
            StoreError::Rejected(message) => message.to_lowercase().contains("truncat"),
            _ => false,
        }
    }
}

/// A schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTable {
    pub schema: String,
    pub name: String,
}

impl QualifiedTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Multi-row insert into one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: QualifiedTable,
    pub columns: Vec<String>,
}

/// Staging-to-target merge keyed on one identity column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatement {
    pub staging: QualifiedTable,
    pub target: QualifiedTable,
    pub columns: Vec<String>,
    pub id_column: String,
}

/// Declared capacity of a text column
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColumnCapacity {
    Bounded(u32),
    Unbounded,
}

impl fmt::Display for ColumnCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnCapacity::Bounded(n) => write!(f, "{}", n),
            ColumnCapacity::Unbounded => write!(f, "unbounded"),
        }
    }
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Delete every row of a table
    async fn delete_all(&self, table: &QualifiedTable) -> Result<u64, StoreError>;

    /// Delete rows whose `column` holds one of `ids`
    async fn delete_scoped(
        &self,
        table: &QualifiedTable,
        column: &str,
        ids: &[FlatValue],
    ) -> Result<u64, StoreError>;

    /// Insert rows in one transaction; nothing is committed on error
    async fn insert_batch(
        &self,
        statement: &InsertStatement,
        rows: &[FlatRecord],
    ) -> Result<u64, StoreError>;

    /// Merge staging into target and empty staging, in one transaction
    async fn merge(&self, statement: &MergeStatement) -> Result<u64, StoreError>;

    async fn truncate(&self, table: &QualifiedTable) -> Result<(), StoreError>;

    /// Declared maximum length of a text column; `None` when unbounded or unknown
    async fn column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
    ) -> Result<Option<u32>, StoreError>;

    async fn set_column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
        capacity: ColumnCapacity,
    ) -> Result<(), StoreError>;

    /// Enable or disable foreign-key enforcement on a table
    async fn set_constraints(&self, table: &QualifiedTable, enabled: bool) -> Result<(), StoreError>;

    /// Replace `snapshot` with the current rows of `source`
    async fn snapshot(
        &self,
        source: &QualifiedTable,
        snapshot: &QualifiedTable,
    ) -> Result<u64, StoreError>;
}

//! Test helpers for apisync integration tests
//!
//! - [`MemoryStore`]: an in-memory [`SyncStore`] with declared column
//!   capacities, poisoned values and injectable failures
//! - [`ScriptedSource`]: a [`RemoteSource`] serving canned listings
//! - Row builders

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use apisync_ingest::flatten::{FlatRecord, FlatValue};
use apisync_ingest::source::{FetchMode, FetchRequest, Fetched, RemoteSource};
use apisync_ingest::store::{
    ColumnCapacity, InsertStatement, MergeStatement, QualifiedTable, StoreError, SyncStore,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<FlatRecord>,
    capacities: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<QualifiedTable, MemTable>,
    poison: Vec<FlatValue>,
    failing_deletes: HashSet<QualifiedTable>,
    failing_toggles: HashSet<QualifiedTable>,
    disabled: HashSet<QualifiedTable>,
    frozen_schema: bool,
    ops: Vec<String>,
    insert_attempts: usize,
}

/// In-memory store
///
/// Inserts fail with a truncation error when a text value is longer than the
/// declared capacity of its column, and with a generic rejection when a row
/// holds a poisoned value. Inserts are all-or-nothing per batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_capacity(&self, table: &QualifiedTable, column: &str, capacity: u32) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .entry(table.clone())
            .or_default()
            .capacities
            .insert(column.to_string(), capacity);
    }

    /// Make any batch containing `value` fail
    pub fn poison(&self, value: FlatValue) {
        self.state.lock().unwrap().poison.push(value);
    }

    pub fn fail_deletes_on(&self, table: &QualifiedTable) {
        self.state.lock().unwrap().failing_deletes.insert(table.clone());
    }

    pub fn fail_toggles_on(&self, table: &QualifiedTable) {
        self.state.lock().unwrap().failing_toggles.insert(table.clone());
    }

    /// Reject every column alteration
    pub fn freeze_schema(&self) {
        self.state.lock().unwrap().frozen_schema = true;
    }

    pub fn seed(&self, table: &QualifiedTable, columns: &[&str], rows: Vec<FlatRecord>) {
        let mut state = self.state.lock().unwrap();
        let entry = state.tables.entry(table.clone()).or_default();
        entry.columns = columns.iter().map(|c| c.to_string()).collect();
        entry.rows.extend(rows);
    }

    pub fn rows(&self, table: &QualifiedTable) -> Vec<FlatRecord> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn capacity(&self, table: &QualifiedTable, column: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|t| t.capacities.get(column).copied())
    }

    pub fn constraints_disabled(&self, table: &QualifiedTable) -> bool {
        self.state.lock().unwrap().disabled.contains(table)
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn insert_attempts(&self) -> usize {
        self.state.lock().unwrap().insert_attempts
    }
}

fn column_index(table: &MemTable, column: &str) -> Option<usize> {
    table.columns.iter().position(|c| c == column)
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn delete_all(&self, table: &QualifiedTable) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(table) {
            return Err(StoreError::Rejected(format!("permission denied for {}", table)));
        }
        state.ops.push(format!("delete_all {}", table));
        let entry = state.tables.entry(table.clone()).or_default();
        let deleted = entry.rows.len() as u64;
        entry.rows.clear();
        Ok(deleted)
    }

    async fn delete_scoped(
        &self,
        table: &QualifiedTable,
        column: &str,
        ids: &[FlatValue],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(table) {
            return Err(StoreError::Rejected(format!("permission denied for {}", table)));
        }
        state.ops.push(format!("delete_scoped {} {}", table, column));
        let entry = state.tables.entry(table.clone()).or_default();
        let Some(index) = column_index(entry, column) else {
            return Ok(0);
        };
        let before = entry.rows.len();
        entry
            .rows
            .retain(|row| row.get(index).is_none_or(|v| !ids.contains(v)));
        Ok((before - entry.rows.len()) as u64)
    }

    async fn insert_batch(
        &self,
        statement: &InsertStatement,
        rows: &[FlatRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.insert_attempts += 1;

        if rows
            .iter()
            .any(|row| row.values().iter().any(|v| state.poison.contains(v)))
        {
            return Err(StoreError::Rejected(
                "invalid input syntax for type integer".to_string(),
            ));
        }

        let entry = state.tables.entry(statement.table.clone()).or_default();
        for row in rows {
            for (column, value) in statement.columns.iter().zip(row.values()) {
                if let (Some(len), Some(capacity)) = (value.text_len(), entry.capacities.get(column)) {
                    if len > *capacity as usize {
                        return Err(StoreError::Truncation {
                            table: statement.table.to_string(),
                            message: format!(
                                "value too long for type character varying({})",
                                capacity
                            ),
                        });
                    }
                }
            }
        }

        entry.columns = statement.columns.clone();
        entry.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn merge(&self, statement: &MergeStatement) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("merge {}", statement.target));

        let staged = state
            .tables
            .get_mut(&statement.staging)
            .map(|t| std::mem::take(&mut t.rows))
            .unwrap_or_default();
        let index = statement
            .columns
            .iter()
            .position(|c| *c == statement.id_column)
            .unwrap_or(0);

        let target = state.tables.entry(statement.target.clone()).or_default();
        target.columns = statement.columns.clone();
        let mut merged = 0;
        for row in staged {
            let id = row.get(index).cloned();
            match target.rows.iter_mut().find(|r| r.get(index).cloned() == id) {
                Some(existing) => *existing = row,
                None => target.rows.push(row),
            }
            merged += 1;
        }
        Ok(merged)
    }

    async fn truncate(&self, table: &QualifiedTable) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("truncate {}", table));
        state.tables.entry(table.clone()).or_default().rows.clear();
        Ok(())
    }

    async fn column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(self.capacity(table, column))
    }

    async fn set_column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
        capacity: ColumnCapacity,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.frozen_schema {
            return Err(StoreError::Unsupported(format!("altering {}.{}", table, column)));
        }
        state.ops.push(format!("widen {} {} {}", table, column, capacity));
        let entry = state.tables.entry(table.clone()).or_default();
        match capacity {
            ColumnCapacity::Bounded(n) => {
                entry.capacities.insert(column.to_string(), n);
            }
            ColumnCapacity::Unbounded => {
                entry.capacities.remove(column);
            }
        }
        Ok(())
    }

    async fn set_constraints(&self, table: &QualifiedTable, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_toggles.contains(table) {
            return Err(StoreError::Rejected(format!("must be owner of table {}", table.name)));
        }
        let action = if enabled { "enable" } else { "disable" };
        state.ops.push(format!("{} {}", action, table));
        if enabled {
            state.disabled.remove(table);
        } else {
            state.disabled.insert(table.clone());
        }
        Ok(())
    }

    async fn snapshot(
        &self,
        source: &QualifiedTable,
        snapshot: &QualifiedTable,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("snapshot {} {}", source, snapshot));
        let copied = state.tables.get(source).cloned().unwrap_or_default();
        let count = copied.rows.len() as u64;
        let entry = state.tables.entry(snapshot.clone()).or_default();
        entry.columns = copied.columns;
        entry.rows = copied.rows;
        Ok(count)
    }
}

/// Source serving fixed listings and records
#[derive(Debug, Default)]
pub struct ScriptedSource {
    name: String,
    page_size: usize,
    listings: HashMap<String, Vec<Value>>,
    records: HashMap<String, Value>,
    calls: Mutex<Vec<String>>,
    authentications: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &str, page_size: usize) -> Self {
        Self {
            name: name.to_string(),
            page_size,
            ..Default::default()
        }
    }

    pub fn listing(mut self, endpoint: &str, items: Vec<Value>) -> Self {
        self.listings.insert(endpoint.to_string(), items);
        self
    }

    pub fn record(mut self, id: &str, record: Value) -> Self {
        self.records.insert(id.to_string(), record);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) {
        self.authentications.fetch_add(1, Ordering::SeqCst);
    }

    async fn fetch(&self, request: &FetchRequest<'_>, mode: FetchMode) -> Fetched {
        self.calls.lock().unwrap().push(format!(
            "{} {:?} since={:?}",
            request.endpoint, mode, request.since
        ));
        let items = self.listings.get(request.endpoint).cloned().unwrap_or_default();

        match mode {
            FetchMode::Count => Fetched::PageCount(items.len().div_ceil(self.page_size) as u32),
            FetchMode::Page(page) => {
                let start = (page as usize - 1) * self.page_size;
                Fetched::Items(items.into_iter().skip(start).take(self.page_size).collect())
            }
            FetchMode::Unpaged => Fetched::Items(items),
            FetchMode::ById { id, .. } => {
                Fetched::Record(self.records.get(&id).cloned().unwrap_or(Value::Null))
            }
        }
    }
}

/// Row of an integer id and a text value
pub fn row(id: i64, text: &str) -> FlatRecord {
    FlatRecord::new(vec![FlatValue::Integer(id), FlatValue::Text(text.to_string())])
}

pub fn ids_of(rows: &[FlatRecord]) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .filter_map(|r| match r.get(0) {
            Some(FlatValue::Integer(n)) => Some(*n),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids
}

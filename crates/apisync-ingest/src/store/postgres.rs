//! PostgreSQL store
//!
//! Values are bound as text and cast to each column's type, so one insert
//! path serves integer, uuid, date and text columns alike. The cast drops
//! the type modifier, which keeps over-long values raising SQLSTATE 22001
//! instead of being silently cut to length.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    ColumnCapacity, InsertStatement, MergeStatement, QualifiedTable, StoreError, SyncStore,
};
use crate::flatten::{FlatRecord, FlatValue};

/// PostgreSQL accepts at most this many bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Identifiers per scoped-delete statement
const DELETE_CHUNK: usize = 500;

/// Fallback cast for columns missing from the catalog
const DEFAULT_CAST: &str = "text";

type ColumnTypes = HashMap<String, String>;

pub struct PgStore {
    pool: PgPool,
    column_types: RwLock<HashMap<QualifiedTable, ColumnTypes>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            column_types: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn column_types(&self, table: &QualifiedTable) -> Result<ColumnTypes, StoreError> {
        if let Some(types) = self.column_types.read().await.get(table) {
            return Ok(types.clone());
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT a.attname::text, format_type(a.atttypid, NULL)
            FROM pg_catalog.pg_attribute a
            WHERE a.attrelid = to_regclass($1)
              AND a.attnum > 0
              AND NOT a.attisdropped
            "#,
        )
        .bind(qualify(table))
        .fetch_all(&self.pool)
        .await?;

        let types: ColumnTypes = rows.into_iter().collect();
        self.column_types
            .write()
            .await
            .insert(table.clone(), types.clone());
        Ok(types)
    }

    async fn forget_column_types(&self, table: &QualifiedTable) {
        self.column_types.write().await.remove(table);
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn delete_all(&self, table: &QualifiedTable) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {}", qualify(table)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_scoped(
        &self,
        table: &QualifiedTable,
        column: &str,
        ids: &[FlatValue],
    ) -> Result<u64, StoreError> {
        let ids: Vec<String> = ids.iter().filter_map(bind_text).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE {}::text IN (",
                qualify(table),
                quote_ident(column)
            ));
            let mut separated = query_builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            deleted += query_builder
                .build()
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        Ok(deleted)
    }

    async fn insert_batch(
        &self,
        statement: &InsertStatement,
        rows: &[FlatRecord],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let table = &statement.table;
        let types = self.column_types(table).await?;
        let casts: Vec<String> = statement
            .columns
            .iter()
            .map(|c| types.get(c).cloned().unwrap_or_else(|| DEFAULT_CAST.to_string()))
            .collect();
        let column_list = statement
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let rows_per_statement = (MAX_BIND_PARAMS / statement.columns.len().max(1)).max(1);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(rows_per_statement) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                qualify(table),
                column_list
            ));

            query_builder.push_values(chunk.iter(), |mut b, row| {
                for (value, cast) in row.values().iter().zip(casts.iter()) {
                    match bind_text(value) {
                        Some(text) => {
                            b.push("CAST(");
                            b.push_bind_unseparated(text);
                            b.push_unseparated(format!(" AS {})", cast));
                        }
                        None => {
                            b.push("NULL");
                        }
                    }
                }
            });

            inserted += query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx(table, e))?
                .rows_affected();
        }

        tx.commit().await.map_err(|e| StoreError::from_sqlx(table, e))?;
        debug!(table = %table, rows = inserted, "Inserted batch");
        Ok(inserted)
    }

    async fn merge(&self, statement: &MergeStatement) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let merged = sqlx::query(&build_merge_sql(statement))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(&statement.target, e))?
            .rows_affected();
        sqlx::query(&format!("TRUNCATE TABLE {}", qualify(&statement.staging)))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(merged)
    }

    async fn truncate(&self, table: &QualifiedTable) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", qualify(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
    ) -> Result<Option<u32>, StoreError> {
        let length: Option<Option<i32>> = sqlx::query_scalar(
            r#"
            SELECT character_maximum_length::int4
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(length.flatten().and_then(|n| u32::try_from(n).ok()))
    }

    async fn set_column_capacity(
        &self,
        table: &QualifiedTable,
        column: &str,
        capacity: ColumnCapacity,
    ) -> Result<(), StoreError> {
        sqlx::query(&build_alter_column_sql(table, column, capacity))
            .execute(&self.pool)
            .await?;
        self.forget_column_types(table).await;
        info!(table = %table, column, capacity = %capacity, "Widened column");
        Ok(())
    }

    async fn set_constraints(&self, table: &QualifiedTable, enabled: bool) -> Result<(), StoreError> {
        let action = if enabled { "ENABLE" } else { "DISABLE" };
        sqlx::query(&format!("ALTER TABLE {} {} TRIGGER ALL", qualify(table), action))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn snapshot(
        &self,
        source: &QualifiedTable,
        snapshot: &QualifiedTable,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("TRUNCATE TABLE {}", qualify(snapshot)))
            .execute(&mut *tx)
            .await?;
        let copied = sqlx::query(&format!(
            "INSERT INTO {} SELECT * FROM {}",
            qualify(snapshot),
            qualify(source)
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(copied)
    }
}

/// Quote a PostgreSQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualify(table: &QualifiedTable) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

/// Text form of a value for a cast bind; `None` for SQL NULL
fn bind_text(value: &FlatValue) -> Option<String> {
    match value {
        FlatValue::Null => None,
        FlatValue::Text(s) => Some(s.clone()),
        FlatValue::Integer(n) => Some(n.to_string()),
        FlatValue::Float(f) => Some(f.to_string()),
        FlatValue::Boolean(b) => Some(b.to_string()),
        FlatValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
    }
}

/// Build the MERGE that upserts staging rows into the target
///
/// Staging rows are de-duplicated on the identity column first; MERGE
/// refuses to touch one target row twice.
pub fn build_merge_sql(statement: &MergeStatement) -> String {
    let id = quote_ident(&statement.id_column);
    let column_list = statement
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let source_values = statement
        .columns
        .iter()
        .map(|c| format!("s.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = statement
        .columns
        .iter()
        .filter(|c| **c != statement.id_column)
        .map(|c| format!("{} = s.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let matched = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("UPDATE SET {}", updates.join(", "))
    };

    format!(
        "MERGE INTO {target} AS t \
         USING (SELECT DISTINCT ON ({id}) * FROM {staging}) AS s \
         ON t.{id} = s.{id} \
         WHEN MATCHED THEN {matched} \
         WHEN NOT MATCHED THEN INSERT ({columns}) VALUES ({values})",
        target = qualify(&statement.target),
        staging = qualify(&statement.staging),
        id = id,
        matched = matched,
        columns = column_list,
        values = source_values,
    )
}

pub fn build_alter_column_sql(table: &QualifiedTable, column: &str, capacity: ColumnCapacity) -> String {
    let column_type = match capacity {
        ColumnCapacity::Bounded(n) => format!("VARCHAR({})", n),
        ColumnCapacity::Unbounded => "TEXT".to_string(),
    };
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
        qualify(table),
        quote_ident(column),
        column_type
    )
}

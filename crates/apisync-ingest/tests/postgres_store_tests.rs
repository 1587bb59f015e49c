//! PostgreSQL store integration tests
//!
//! These tests exercise [`PgStore`] against a real database:
//! - Typed inserts through text binds
//! - Truncation classification and column widening
//! - Staging merges and scoped deletes
//! - Trigger toggling and snapshots
//!
//! **Requirements**:
//! - PostgreSQL must be running and accessible
//! - DATABASE_URL environment variable must be set
//! - Tests will be skipped if DATABASE_URL is not configured
//!
//! Every test works in its own pair of schemas, dropped at the end.
//!
//! **Running tests**:
//! ```bash
//! DATABASE_URL=postgresql://localhost/apisync_test cargo test --test postgres_store_tests
//! ```

use apisync_ingest::flatten::{FlatRecord, FlatValue};
use apisync_ingest::loader::{AdaptiveWidening, TableLayout, UpsertLoader};
use apisync_ingest::store::{ColumnCapacity, InsertStatement, PgStore, QualifiedTable, SyncStore};
use std::sync::Arc;
use std::time::Duration;

/// Connect and create fresh target and staging schemas
async fn setup_store() -> Option<(Arc<PgStore>, TableLayout)> {
    let url = std::env::var("DATABASE_URL").ok()?;

    let store = match PgStore::connect(&url, 2, Duration::from_secs(5)).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to connect to PostgreSQL: {}", e);
            return None;
        }
    };

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let layout = TableLayout {
        target_schema: format!("t_{}", suffix),
        staging_schema: format!("s_{}", suffix),
        ..TableLayout::default()
    };
    for schema in [&layout.target_schema, &layout.staging_schema] {
        sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema))
            .execute(store.pool())
            .await
            .expect("Failed to create schema");
    }

    Some((Arc::new(store), layout))
}

async fn teardown(store: &PgStore, layout: &TableLayout) {
    for schema in [&layout.target_schema, &layout.staging_schema] {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema))
            .execute(store.pool())
            .await
            .ok();
    }
}

async fn create_table(store: &PgStore, table: &QualifiedTable, definition: &str) {
    sqlx::query(&format!(
        "CREATE TABLE \"{}\".\"{}\" ({})",
        table.schema, table.name, definition
    ))
    .execute(store.pool())
    .await
    .expect("Failed to create table");
}

async fn count(store: &PgStore, table: &QualifiedTable) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM \"{}\".\"{}\"",
        table.schema, table.name
    ))
    .fetch_one(store.pool())
    .await
    .expect("Failed to count rows")
}

fn contact(id: i64, name: &str) -> FlatRecord {
    FlatRecord::new(vec![FlatValue::Integer(id), FlatValue::from(name)])
}

fn columns() -> Vec<String> {
    vec!["ContactID".to_string(), "Name".to_string()]
}

#[tokio::test]
async fn test_truncation_is_classified_and_widened() {
    let Some((store, layout)) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = layout.target("contacts");
    create_table(&store, &table, "\"ContactID\" integer, \"Name\" varchar(10)").await;
    let statement = InsertStatement {
        table: table.clone(),
        columns: columns(),
    };

    let err = store
        .insert_batch(&statement, &[contact(1, "a name longer than ten")])
        .await
        .unwrap_err();
    assert!(err.is_truncation(), "unexpected error: {}", err);
    assert_eq!(count(&store, &table).await, 0);

    assert_eq!(store.column_capacity(&table, "Name").await.unwrap(), Some(10));
    store
        .set_column_capacity(&table, "Name", ColumnCapacity::Bounded(100))
        .await
        .unwrap();
    assert_eq!(store.column_capacity(&table, "Name").await.unwrap(), Some(100));

    let inserted = store
        .insert_batch(&statement, &[contact(1, "a name longer than ten")])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    teardown(&store, &layout).await;
}

#[tokio::test]
async fn test_loader_widens_and_merges() {
    let Some((store, layout)) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let definition = "\"ContactID\" integer, \"Name\" varchar(20)";
    create_table(&store, &layout.staging("contacts"), definition).await;
    create_table(&store, &layout.target("contacts"), definition).await;

    let loader = UpsertLoader::new(store.clone(), Box::new(AdaptiveWidening::default()), 1000);
    let plan = layout.staged_plan("contacts", columns(), "ContactID");

    loader
        .load(&[contact(1, "Acme"), contact(2, "Globex")], &plan)
        .await
        .unwrap();
    let report = loader
        .load(&[contact(2, &"G".repeat(150)), contact(3, "Initech")], &plan)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.merged_rows, Some(2));
    assert_eq!(count(&store, &layout.staging("contacts")).await, 0);
    assert_eq!(count(&store, &layout.target("contacts")).await, 3);
    assert_eq!(
        store.column_capacity(&layout.target("contacts"), "Name").await.unwrap(),
        Some(200)
    );

    teardown(&store, &layout).await;
}

#[tokio::test]
async fn test_scoped_delete_and_snapshot() {
    let Some((store, layout)) = setup_store().await else {
        eprintln!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let lines = layout.target("sale_lines");
    let backup = layout.backup("sale_lines");
    create_table(&store, &lines, "\"SaleID\" uuid, \"SKU\" text").await;
    create_table(&store, &backup, "\"SaleID\" uuid, \"SKU\" text").await;

    let first = "6f1c3f1e-8f5b-4c55-9d7e-0d3c2b1a0001";
    let second = "6f1c3f1e-8f5b-4c55-9d7e-0d3c2b1a0002";
    let statement = InsertStatement {
        table: lines.clone(),
        columns: vec!["SaleID".to_string(), "SKU".to_string()],
    };
    let line = |sale: &str, sku: &str| FlatRecord::new(vec![FlatValue::from(sale), FlatValue::from(sku)]);
    store
        .insert_batch(
            &statement,
            &[line(first, "A"), line(first, "B"), line(second, "C")],
        )
        .await
        .unwrap();

    let deleted = store
        .delete_scoped(&lines, "SaleID", &[FlatValue::from(first)])
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    assert_eq!(store.snapshot(&lines, &backup).await.unwrap(), 1);
    assert_eq!(count(&store, &backup).await, 1);

    store.set_constraints(&lines, false).await.unwrap();
    store.set_constraints(&lines, true).await.unwrap();

    teardown(&store, &layout).await;
}

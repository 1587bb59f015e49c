//! Adaptive upsert loader
//!
//! Rows are written in fixed-size batches, each in its own transaction.
//! A batch gets at most two attempts; between them the configured
//! [`SchemaEvolution`] strategy may widen columns. A batch that fails twice
//! is recorded in the [`LoadReport`] and skipped, and loading continues with
//! the next one.
//!
//! Without a merge step the rows already in the target are deleted first
//! (all of them, or those in a [`Scope`]). With a merge step rows go to
//! staging and are merged into the target at the end, which also empties
//! staging.

pub mod statements;
pub mod widening;

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::flatten::{FlatRecord, FlatValue};
use crate::store::{InsertStatement, MergeStatement, QualifiedTable, StoreError, SyncStore};

pub use statements::TableLayout;
pub use widening::{
    AdaptiveWidening, Evolution, EvolutionStrategy, FailFast, NoEvolution, SchemaEvolution,
    WidenedColumn, WideningPolicy,
};

/// Default number of rows per batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Insert attempts per batch
pub const MAX_ATTEMPTS: u32 = 2;

/// Rows of a reload limited to known parents
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub column: String,
    pub ids: Vec<FlatValue>,
}

/// Statements for loading one table
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub insert: InsertStatement,
    pub merge: Option<MergeStatement>,
    pub scope: Option<Scope>,
    /// Tables whose columns are widened together
    pub widen: Vec<QualifiedTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBatch {
    pub index: usize,
    pub rows: usize,
    pub error: String,
}

/// Outcome of one load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub table: QualifiedTable,
    pub records: usize,
    pub batches: usize,
    pub committed_rows: u64,
    pub deleted_rows: u64,
    pub merged_rows: Option<u64>,
    pub skipped: Vec<SkippedBatch>,
    pub widened: Vec<WidenedColumn>,
}

impl LoadReport {
    fn new(table: QualifiedTable, records: usize) -> Self {
        Self {
            table,
            records,
            batches: 0,
            committed_rows: 0,
            deleted_rows: 0,
            merged_rows: None,
            skipped: Vec::new(),
            widened: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn skipped_rows(&self) -> usize {
        self.skipped.iter().map(|s| s.rows).sum()
    }
}

pub struct UpsertLoader {
    store: Arc<dyn SyncStore>,
    evolution: Box<dyn SchemaEvolution>,
    batch_size: usize,
}

impl UpsertLoader {
    pub fn new(store: Arc<dyn SyncStore>, evolution: Box<dyn SchemaEvolution>, batch_size: usize) -> Self {
        Self {
            store,
            evolution,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Load `records` according to `plan`
    ///
    /// Batch failures are collected in the report. Errors from the
    /// pre-load delete or the merge abort the load.
    #[instrument(skip_all, fields(table = %plan.target_table(), records = records.len()))]
    pub async fn load(&self, records: &[FlatRecord], plan: &LoadPlan) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::new(plan.target_table().clone(), records.len());

        if plan.merge.is_none() {
            report.deleted_rows = match &plan.scope {
                Some(scope) => {
                    self.store
                        .delete_scoped(&plan.insert.table, &scope.column, &scope.ids)
                        .await?
                }
                None => self.store.delete_all(&plan.insert.table).await?,
            };
        }

        for (index, batch) in records.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            self.write_batch(index, batch, plan, &mut report).await;
        }

        if let Some(merge) = &plan.merge {
            report.merged_rows = Some(self.store.merge(merge).await?);
        }

        if report.is_complete() {
            info!(
                committed = report.committed_rows,
                batches = report.batches,
                "Load complete"
            );
        } else {
            warn!(
                committed = report.committed_rows,
                skipped_batches = report.skipped.len(),
                skipped_rows = report.skipped_rows(),
                "Load finished with skipped batches"
            );
        }

        Ok(report)
    }

    async fn write_batch(&self, index: usize, batch: &[FlatRecord], plan: &LoadPlan, report: &mut LoadReport) {
        let table = &plan.insert.table;
        let mut attempt = 1;

        loop {
            let err = match self.store.insert_batch(&plan.insert, batch).await {
                Ok(rows) => {
                    report.committed_rows += rows;
                    return;
                }
                Err(e) => e,
            };

            if attempt >= MAX_ATTEMPTS {
                error!(table = %table, batch = index, rows = batch.len(), error = %err, "Batch abandoned");
                report.skipped.push(SkippedBatch {
                    index,
                    rows: batch.len(),
                    error: err.to_string(),
                });
                return;
            }

            warn!(
                table = %table,
                batch = index,
                attempt,
                truncation = err.is_truncation(),
                error = %err,
                "Batch insert failed"
            );

            match self.evolution.evolve(self.store.as_ref(), plan, batch, &err).await {
                Ok(Evolution::Retry { widened }) => report.widened.extend(widened),
                Ok(Evolution::Abandon) => {
                    error!(
                        table = %table,
                        batch = index,
                        strategy = self.evolution.name(),
                        error = %err,
                        "Batch abandoned without retry"
                    );
                    report.skipped.push(SkippedBatch {
                        index,
                        rows: batch.len(),
                        error: err.to_string(),
                    });
                    return;
                }
                Err(evolve_err) => {
                    warn!(table = %table, batch = index, error = %evolve_err, "Schema evolution failed");
                }
            }

            attempt += 1;
        }
    }
}

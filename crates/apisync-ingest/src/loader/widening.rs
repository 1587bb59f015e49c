//! Schema evolution on write
//!
//! After the first failed attempt at a batch the loader asks its
//! [`SchemaEvolution`] strategy what to do. [`AdaptiveWidening`] enlarges
//! text columns that a truncation error says are too small; stores that
//! cannot alter columns use [`NoEvolution`] or [`FailFast`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::LoadPlan;
use crate::flatten::FlatRecord;
use crate::store::{ColumnCapacity, QualifiedTable, StoreError, SyncStore};

/// Default rounding step for widened columns
pub const DEFAULT_WIDENING_STEP: u32 = 100;

/// Default length above which a column becomes unbounded
pub const DEFAULT_UNBOUNDED_ABOVE: u32 = 8000;

/// Rounding rule for new column capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WideningPolicy {
    pub step: u32,
    pub unbounded_above: u32,
}

impl Default for WideningPolicy {
    fn default() -> Self {
        Self {
            step: DEFAULT_WIDENING_STEP,
            unbounded_above: DEFAULT_UNBOUNDED_ABOVE,
        }
    }
}

impl WideningPolicy {
    /// Capacity that fits `required` characters
    pub fn capacity_for(&self, required: u32) -> ColumnCapacity {
        if required > self.unbounded_above {
            return ColumnCapacity::Unbounded;
        }
        let step = self.step.max(1);
        ColumnCapacity::Bounded(required.div_ceil(step).saturating_mul(step))
    }

    /// New capacity for a column, or `None` when it already fits
    ///
    /// Unbounded columns are never touched, so capacities only grow.
    pub fn widen(&self, declared: Option<u32>, required: u32) -> Option<ColumnCapacity> {
        match declared {
            Some(declared) if required > declared => Some(self.capacity_for(required)),
            _ => None,
        }
    }
}

/// A column whose capacity was raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidenedColumn {
    pub table: QualifiedTable,
    pub column: String,
    pub from: u32,
    pub to: ColumnCapacity,
}

/// Decision taken after a batch's first failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evolution {
    /// Try the batch once more
    Retry { widened: Vec<WidenedColumn> },
    /// Give the batch up without a second attempt
    Abandon,
}

#[async_trait]
pub trait SchemaEvolution: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evolve(
        &self,
        store: &dyn SyncStore,
        plan: &LoadPlan,
        batch: &[FlatRecord],
        error: &StoreError,
    ) -> Result<Evolution, StoreError>;
}

/// Widen too-small text columns, then retry
#[derive(Debug, Clone, Default)]
pub struct AdaptiveWidening {
    policy: WideningPolicy,
}

impl AdaptiveWidening {
    pub fn new(policy: WideningPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl SchemaEvolution for AdaptiveWidening {
    fn name(&self) -> &'static str {
        "adaptive_widening"
    }

    async fn evolve(
        &self,
        store: &dyn SyncStore,
        plan: &LoadPlan,
        batch: &[FlatRecord],
        error: &StoreError,
    ) -> Result<Evolution, StoreError> {
        if !error.is_truncation() {
            return Ok(Evolution::Retry { widened: Vec::new() });
        }

        let mut widened = Vec::new();
        for (column, required) in longest_text_per_column(&plan.insert.columns, batch) {
            // Each table is checked on its own so a wider column is never narrowed
            for table in &plan.widen {
                let declared = store.column_capacity(table, &column).await?;
                let Some(capacity) = self.policy.widen(declared, required) else {
                    debug!(table = %table, column = %column, required, declared = ?declared, "Column already fits");
                    continue;
                };

                store.set_column_capacity(table, &column, capacity).await?;
                info!(
                    table = %table,
                    column = %column,
                    required,
                    capacity = %capacity,
                    "Widening column after truncation"
                );
                widened.push(WidenedColumn {
                    table: table.clone(),
                    column: column.clone(),
                    from: declared.unwrap_or_default(),
                    to: capacity,
                });
            }
        }

        Ok(Evolution::Retry { widened })
    }
}

/// Leave the schema alone; the batch still gets its second attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvolution;

#[async_trait]
impl SchemaEvolution for NoEvolution {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn evolve(
        &self,
        _store: &dyn SyncStore,
        _plan: &LoadPlan,
        _batch: &[FlatRecord],
        _error: &StoreError,
    ) -> Result<Evolution, StoreError> {
        Ok(Evolution::Retry { widened: Vec::new() })
    }
}

/// Abandon truncated batches immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

#[async_trait]
impl SchemaEvolution for FailFast {
    fn name(&self) -> &'static str {
        "fail_fast"
    }

    async fn evolve(
        &self,
        _store: &dyn SyncStore,
        _plan: &LoadPlan,
        _batch: &[FlatRecord],
        error: &StoreError,
    ) -> Result<Evolution, StoreError> {
        if error.is_truncation() {
            Ok(Evolution::Abandon)
        } else {
            Ok(Evolution::Retry { widened: Vec::new() })
        }
    }
}

/// Selectable strategy in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    #[default]
    AdaptiveWidening,
    None,
    FailFast,
}

impl EvolutionStrategy {
    pub fn build(self, policy: WideningPolicy) -> Box<dyn SchemaEvolution> {
        match self {
            EvolutionStrategy::AdaptiveWidening => Box::new(AdaptiveWidening::new(policy)),
            EvolutionStrategy::None => Box::new(NoEvolution),
            EvolutionStrategy::FailFast => Box::new(FailFast),
        }
    }
}

/// Longest text value per column, keyed by column name
pub fn longest_text_per_column(columns: &[String], batch: &[FlatRecord]) -> BTreeMap<String, u32> {
    let mut longest: BTreeMap<String, u32> = BTreeMap::new();
    for row in batch {
        for (column, value) in columns.iter().zip(row.values()) {
            if let Some(len) = value.text_len() {
                let len = u32::try_from(len).unwrap_or(u32::MAX);
                let entry = longest.entry(column.clone()).or_default();
                *entry = (*entry).max(len);
            }
        }
    }
    longest
}

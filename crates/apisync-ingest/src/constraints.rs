//! Foreign-key enforcement around reload windows

use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{QualifiedTable, SyncStore};

/// Failure to toggle one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleFailure {
    pub table: QualifiedTable,
    pub enabled: bool,
    pub error: String,
}

pub struct ConstraintToggler {
    store: Arc<dyn SyncStore>,
}

impl ConstraintToggler {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Disable enforcement on every table, continuing past failures
    pub async fn disable(&self, tables: &[QualifiedTable]) -> Vec<ToggleFailure> {
        self.set(tables, false).await
    }

    /// Re-enable enforcement on every table, continuing past failures
    pub async fn enable(&self, tables: &[QualifiedTable]) -> Vec<ToggleFailure> {
        self.set(tables, true).await
    }

    async fn set(&self, tables: &[QualifiedTable], enabled: bool) -> Vec<ToggleFailure> {
        let mut failures = Vec::new();

        for table in tables {
            if let Err(e) = self.store.set_constraints(table, enabled).await {
                warn!(table = %table, enabled, error = %e, "Failed to toggle constraints");
                failures.push(ToggleFailure {
                    table: table.clone(),
                    enabled,
                    error: e.to_string(),
                });
            }
        }

        info!(
            tables = tables.len(),
            failed = failures.len(),
            enabled,
            "Toggled foreign-key enforcement"
        );
        failures
    }
}

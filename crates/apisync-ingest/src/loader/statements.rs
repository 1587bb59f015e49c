//! Table layout and load plans

use serde::{Deserialize, Serialize};

use super::{LoadPlan, Scope};
use crate::flatten::FlatValue;
use crate::store::{InsertStatement, MergeStatement, QualifiedTable};

pub const DEFAULT_TARGET_SCHEMA: &str = "public";
pub const DEFAULT_STAGING_SCHEMA: &str = "staging";
pub const DEFAULT_BACKUP_PREFIX: &str = "b_";

/// Where target, staging and snapshot tables live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableLayout {
    pub target_schema: String,
    pub staging_schema: String,
    pub backup_prefix: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            target_schema: DEFAULT_TARGET_SCHEMA.to_string(),
            staging_schema: DEFAULT_STAGING_SCHEMA.to_string(),
            backup_prefix: DEFAULT_BACKUP_PREFIX.to_string(),
        }
    }
}

impl TableLayout {
    pub fn target(&self, table: &str) -> QualifiedTable {
        QualifiedTable::new(&self.target_schema, table)
    }

    pub fn staging(&self, table: &str) -> QualifiedTable {
        QualifiedTable::new(&self.staging_schema, table)
    }

    pub fn backup(&self, table: &str) -> QualifiedTable {
        QualifiedTable::new(&self.target_schema, format!("{}{}", self.backup_prefix, table))
    }

    /// Insert into staging, then merge into the target on `id_column`
    pub fn staged_plan(&self, table: &str, columns: Vec<String>, id_column: &str) -> LoadPlan {
        let staging = self.staging(table);
        let target = self.target(table);

        LoadPlan {
            insert: InsertStatement {
                table: staging.clone(),
                columns: columns.clone(),
            },
            merge: Some(MergeStatement {
                staging: staging.clone(),
                target: target.clone(),
                columns,
                id_column: id_column.to_string(),
            }),
            scope: None,
            widen: vec![staging, target],
        }
    }

    /// Delete, then insert straight into the target
    pub fn direct_plan(&self, table: &str, columns: Vec<String>) -> LoadPlan {
        let target = self.target(table);

        LoadPlan {
            insert: InsertStatement {
                table: target.clone(),
                columns,
            },
            merge: None,
            scope: None,
            widen: vec![target],
        }
    }
}

impl LoadPlan {
    /// Limit the pre-load delete to rows whose `column` is in `ids`
    pub fn scoped(mut self, column: impl Into<String>, ids: Vec<FlatValue>) -> Self {
        self.scope = Some(Scope {
            column: column.into(),
            ids,
        });
        self
    }

    /// Table that ends up holding the rows
    pub fn target_table(&self) -> &QualifiedTable {
        match &self.merge {
            Some(merge) => &merge.target,
            None => &self.insert.table,
        }
    }
}

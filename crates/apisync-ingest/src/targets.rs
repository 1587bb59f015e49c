//! Sync target documents
//!
//! A target document is a JSON array of [`SyncTarget`] entries. Entries are
//! validated when the document is loaded, so a bad key or an empty field list
//! stops the run before any remote call is made.

use apisync_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::flatten::MAX_CONTEXTS;

/// Sentinel replaced by the incremental lower bound in query templates
pub const DATE_SENTINEL: &str = "__DATE__";

fn default_paged() -> bool {
    true
}

/// How a target's records are extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    /// Listing flattened straight into the target table
    Table,
    /// Listing loaded as parents, then each nested array as a child table
    Nested,
    /// Identifiers listed from a secondary endpoint, records fetched one by one
    Record,
}

/// One synced entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncTarget {
    /// Listing endpoint, relative to the source base URL
    pub endpoint: String,

    /// Target table; defaults to the source table prefix plus the endpoint
    #[serde(default)]
    pub table: Option<String>,

    /// Response key holding the item array; defaults to the endpoint
    #[serde(default)]
    pub list_field: Option<String>,

    pub fields: Vec<String>,

    #[serde(default)]
    pub date_fields: BTreeSet<String>,

    /// Identity field; defaults to the first field
    #[serde(default)]
    pub id_field: Option<String>,

    /// Source field name to column name; never applied to the first field
    #[serde(default)]
    pub mod_fields: BTreeMap<String, String>,

    #[serde(default)]
    pub staging: bool,

    #[serde(default)]
    pub backup: bool,

    /// Listing query template; values equal to `__DATE__` take the lower bound
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    /// Extra query parameters for by-id fetches
    #[serde(default)]
    pub params_id: BTreeMap<String, Value>,

    #[serde(default)]
    pub endpoint_id: Option<String>,

    /// Key of the identifier in each item listed from `endpoint_id`
    #[serde(default)]
    pub list_id: Option<String>,

    /// Modification date used for client-side filtering of listed identifiers
    #[serde(default)]
    pub list_date: Option<String>,

    #[serde(default)]
    pub first_of_month: bool,

    #[serde(default = "default_paged")]
    pub paged: bool,

    #[serde(default)]
    pub nested: Vec<NestedSpec>,
}

/// Child records stored under a key of each parent item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NestedSpec {
    pub nest: String,

    /// Child table; defaults to `<parent table>_<nest>`
    #[serde(default)]
    pub table: Option<String>,

    /// The first field is the parent-reference column
    pub fields: Vec<String>,

    #[serde(default)]
    pub date_fields: BTreeSet<String>,

    #[serde(default)]
    pub mod_fields: BTreeMap<String, String>,

    #[serde(default)]
    pub backup: bool,

    /// Deeper level whose items supply some of the fields
    #[serde(default)]
    pub context: Option<Box<NestedContext>>,
}

/// A deeper nesting level contributing a subset of the fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NestedContext {
    pub nest: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub context: Option<Box<NestedContext>>,
}

impl SyncTarget {
    pub fn mode(&self) -> TargetMode {
        if self.nested.is_empty() {
            TargetMode::Table
        } else if self.endpoint_id.is_some() {
            TargetMode::Record
        } else {
            TargetMode::Nested
        }
    }

    pub fn table_name(&self, prefix: &str) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None => format!("{}{}", prefix, self.endpoint),
        }
    }

    pub fn list_field(&self) -> &str {
        self.list_field.as_deref().unwrap_or(&self.endpoint)
    }

    pub fn id_field(&self) -> &str {
        self.id_field
            .as_deref()
            .or_else(|| self.fields.first().map(String::as_str))
            .unwrap_or_default()
    }

    /// Store column names in field order
    pub fn columns(&self) -> Vec<String> {
        rename_columns(&self.fields, &self.mod_fields)
    }

    /// Store column holding the identifier, after renames
    pub fn id_column(&self) -> String {
        let id = self.id_field();
        self.fields
            .iter()
            .position(|field| field == id)
            .and_then(|index| self.columns().into_iter().nth(index))
            .unwrap_or_else(|| id.to_string())
    }

    /// Listing query parameters with the date sentinel resolved
    ///
    /// Keys whose template value is the sentinel are dropped when no bound
    /// applies.
    pub fn listing_params(&self, lower_bound: Option<&str>) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter_map(|(key, value)| match value {
                Value::String(s) if s == DATE_SENTINEL => {
                    lower_bound.map(|bound| (key.clone(), bound.to_string()))
                }
                other => Some((key.clone(), param_text(other))),
            })
            .collect()
    }

    pub fn by_id_params(&self) -> Vec<(String, String)> {
        self.params_id
            .iter()
            .map(|(key, value)| (key.clone(), param_text(value)))
            .collect()
    }

    /// Tables whose constraints are toggled around this target's reload
    pub fn reload_tables(&self, prefix: &str) -> Vec<String> {
        let table = self.table_name(prefix);
        let mut tables = vec![table.clone()];
        tables.extend(self.nested.iter().map(|n| n.table_name(&table)));
        tables
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.endpoint;

        if self.endpoint.trim().is_empty() {
            return Err(SyncError::invalid_target(name, "endpoint is empty"));
        }
        if self.fields.is_empty() {
            return Err(SyncError::invalid_target(name, "field list is empty"));
        }
        if let Some(id) = &self.id_field {
            if !self.fields.contains(id) {
                return Err(SyncError::invalid_target(
                    name,
                    format!("id_field '{}' is not in the field list", id),
                ));
            }
        }
        if self.endpoint_id.is_some() && self.list_id.is_none() {
            return Err(SyncError::invalid_target(name, "endpoint_id requires list_id"));
        }
        if self.endpoint_id.is_some() && self.nested.is_empty() {
            return Err(SyncError::invalid_target(
                name,
                "record targets need at least one nested spec",
            ));
        }

        for nested in &self.nested {
            nested.validate(name)?;
        }

        Ok(())
    }
}

impl NestedSpec {
    pub fn table_name(&self, parent_table: &str) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None => format!("{}_{}", parent_table, self.nest),
        }
    }

    /// Parent-reference field; also the scope key of incremental reloads
    pub fn parent_field(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or_default()
    }

    pub fn columns(&self) -> Vec<String> {
        rename_columns(&self.fields, &self.mod_fields)
    }

    /// Context levels, nearest first
    pub fn contexts(&self) -> Vec<&NestedContext> {
        let mut levels = Vec::new();
        let mut next = self.context.as_deref();
        while let Some(level) = next {
            levels.push(level);
            next = level.context.as_deref();
        }
        levels
    }

    fn validate(&self, target: &str) -> Result<()> {
        let name = format!("{}.{}", target, self.nest);

        if self.nest.trim().is_empty() {
            return Err(SyncError::invalid_target(target, "nested key is empty"));
        }
        if self.fields.is_empty() {
            return Err(SyncError::invalid_target(name, "field list is empty"));
        }

        let contexts = self.contexts();
        if contexts.len() > MAX_CONTEXTS {
            return Err(SyncError::invalid_target(
                name,
                format!(
                    "nesting depth {} exceeds the maximum of {}",
                    contexts.len(),
                    MAX_CONTEXTS
                ),
            ));
        }
        for context in contexts {
            if context.fields.is_empty() {
                return Err(SyncError::invalid_target(
                    &name,
                    format!("context '{}' has an empty field list", context.nest),
                ));
            }
        }

        Ok(())
    }
}

/// Apply a rename map to every field but the first
pub fn rename_columns(fields: &[String], renames: &BTreeMap<String, String>) -> Vec<String> {
    fields
        .iter()
        .enumerate()
        .map(|(i, field)| match renames.get(field) {
            Some(renamed) if i > 0 => renamed.clone(),
            _ => field.clone(),
        })
        .collect()
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse and validate a target document
pub fn parse_targets(raw: &str) -> Result<Vec<SyncTarget>> {
    let targets: Vec<SyncTarget> = serde_json::from_str(raw)?;
    for target in &targets {
        target.validate()?;
    }
    Ok(targets)
}

/// Read, parse and validate a target document from disk
pub fn load_targets(path: &Path) -> Result<Vec<SyncTarget>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SyncError::config(format!("cannot read target document {}: {}", path.display(), e))
    })?;
    parse_targets(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(value: Value) -> SyncTarget {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let t = target(json!({"endpoint": "Invoices", "fields": ["InvoiceID", "Total"]}));

        assert_eq!(t.mode(), TargetMode::Table);
        assert_eq!(t.table_name("xero_"), "xero_Invoices");
        assert_eq!(t.list_field(), "Invoices");
        assert_eq!(t.id_field(), "InvoiceID");
        assert!(t.paged);
        assert!(!t.staging);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_json::from_value::<SyncTarget>(
            json!({"endpoint": "x", "fields": ["a"], "tabel": "typo"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(serde_json::from_value::<SyncTarget>(json!({"endpoint": "x"})).is_err());
    }

    #[test]
    fn test_first_field_never_renamed() {
        let t = target(json!({
            "endpoint": "Sale",
            "fields": ["ID", "Status", "ID"],
            "mod_fields": {"ID": "SaleID", "Status": "SaleStatus"}
        }));
        assert_eq!(t.columns(), vec!["ID", "SaleStatus", "SaleID"]);
    }

    #[test]
    fn test_renamed_id_field_is_the_merge_column() {
        let t = target(json!({
            "endpoint": "Journals",
            "fields": ["JournalNumber", "JournalID", "Reference"],
            "id_field": "JournalID",
            "mod_fields": {"JournalID": "ID"}
        }));
        assert_eq!(t.id_field(), "JournalID");
        assert_eq!(t.id_column(), "ID");

        let plain = target(json!({"endpoint": "Invoices", "fields": ["InvoiceID", "Total"]}));
        assert_eq!(plain.id_column(), "InvoiceID");
    }

    #[test]
    fn test_date_sentinel() {
        let t = target(json!({
            "endpoint": "SaleList",
            "fields": ["ID"],
            "params": {"UpdatedSince": "__DATE__", "Status": "ALL", "Limit": 5}
        }));

        let with_bound = t.listing_params(Some("2024-03-03T00:00:00"));
        assert_eq!(
            with_bound,
            vec![
                ("Limit".to_string(), "5".to_string()),
                ("Status".to_string(), "ALL".to_string()),
                ("UpdatedSince".to_string(), "2024-03-03T00:00:00".to_string()),
            ]
        );

        let without = t.listing_params(None);
        assert_eq!(without.len(), 2);
        assert!(without.iter().all(|(k, _)| k != "UpdatedSince"));
    }

    #[test]
    fn test_nested_table_names_and_modes() {
        let t = target(json!({
            "endpoint": "SaleList",
            "table": "sale",
            "fields": ["ID"],
            "endpoint_id": "SaleList",
            "list_id": "SaleID",
            "nested": [
                {"nest": "Lines", "fields": ["SaleID", "SKU"]},
                {"nest": "Invoices", "table": "sale_invoice", "fields": ["SaleID", "Number"]}
            ]
        }));

        t.validate().unwrap();
        assert_eq!(t.mode(), TargetMode::Record);
        assert_eq!(t.reload_tables(""), vec!["sale", "sale_Lines", "sale_invoice"]);
        assert_eq!(t.nested[0].parent_field(), "SaleID");
    }

    #[test]
    fn test_nesting_depth_limit() {
        let doc = json!([{
            "endpoint": "Orders",
            "fields": ["ID"],
            "nested": [{
                "nest": "Lines",
                "fields": ["OrderID", "Batch"],
                "context": {
                    "nest": "Batches",
                    "fields": ["Batch"],
                    "context": {
                        "nest": "Serials",
                        "fields": ["Serial"],
                        "context": {"nest": "Too", "fields": ["Deep"]}
                    }
                }
            }]
        }]);

        let err = parse_targets(&doc.to_string()).unwrap_err();
        assert!(err.to_string().contains("nesting depth 3"));
    }

    #[test]
    fn test_empty_fields_rejected() {
        let doc = json!([{"endpoint": "Items", "fields": []}]);
        let err = parse_targets(&doc.to_string()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTarget { .. }));
    }

    #[test]
    fn test_record_mode_requires_list_id() {
        let t = target(json!({
            "endpoint": "Sale",
            "fields": ["ID"],
            "endpoint_id": "SaleList",
            "nested": [{"nest": "Lines", "fields": ["SaleID"]}]
        }));
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_load_targets_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, r#"[{"endpoint": "Contacts", "fields": ["ContactID"]}]"#).unwrap();

        let targets = load_targets(&path).unwrap();
        assert_eq!(targets.len(), 1);

        let missing = load_targets(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, SyncError::Config(_)));
    }
}

//! Hierarchical record flattening
//!
//! A [`FieldPlan`] is compiled once per configured field list. Each field is
//! tagged with the place its value comes from, so flattening an item is a
//! straight walk over the plan:
//!
//! 1. the parent override (first occurrence of the parent field only)
//! 2. the nearest context (`Context1`)
//! 3. the next context (`Context2`)
//! 4. the item itself, following a separated path through nested objects
//!
//! Records whose values all resolve to null are suppressed.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::dates::DateFormat;

/// Maximum number of context levels below a nested record
pub const MAX_CONTEXTS: usize = 2;

/// Default separator for path lookups such as `Contact.Name`
pub const DEFAULT_PATH_SEPARATOR: &str = ".";

/// One column value of a flattened record
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
}

impl FlatValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FlatValue::Null)
    }

    /// Character length of a text value
    pub fn text_len(&self) -> Option<usize> {
        match self {
            FlatValue::Text(s) => Some(s.chars().count()),
            _ => None,
        }
    }

    /// Convert a JSON value; objects and arrays are kept as JSON text
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FlatValue::Null,
            Value::Bool(b) => FlatValue::Boolean(*b),
            Value::Number(n) => n
                .as_i64()
                .map(FlatValue::Integer)
                .or_else(|| n.as_f64().map(FlatValue::Float))
                .unwrap_or(FlatValue::Null),
            Value::String(s) => FlatValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => FlatValue::Text(value.to_string()),
        }
    }
}

impl From<&str> for FlatValue {
    fn from(value: &str) -> Self {
        FlatValue::Text(value.to_string())
    }
}

impl From<i64> for FlatValue {
    fn from(value: i64) -> Self {
        FlatValue::Integer(value)
    }
}

/// Values positionally aligned with a field list
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord(Vec<FlatValue>);

impl FlatRecord {
    pub fn new(values: Vec<FlatValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[FlatValue] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&FlatValue> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<FlatValue> {
        self.0
    }
}

/// Where a planned field takes its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Base,
    ParentOverride,
    Context1,
    Context2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("field list is empty")]
    EmptyFieldList,

    #[error("{0} context levels configured, at most {MAX_CONTEXTS} are supported")]
    TooManyContexts(usize),
}

#[derive(Debug, Clone)]
struct PlannedField {
    name: String,
    source: FieldSource,
    path: Vec<String>,
    is_date: bool,
}

/// Per-field resolution plan for one configured field list
#[derive(Debug, Clone)]
pub struct FieldPlan {
    fields: Vec<PlannedField>,
    date_format: DateFormat,
}

impl FieldPlan {
    pub fn builder(fields: &[String]) -> FieldPlanBuilder<'_> {
        FieldPlanBuilder {
            fields,
            date_fields: None,
            parent: None,
            contexts: Vec::new(),
            date_format: DateFormat::default(),
            separator: DEFAULT_PATH_SEPARATOR.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolution tag of each field, in order
    pub fn sources(&self) -> Vec<FieldSource> {
        self.fields.iter().map(|f| f.source).collect()
    }

    /// Flatten one item
    ///
    /// `parent` is the value substituted for the parent field; `contexts`
    /// holds the nearest context first. Returns `None` when every value is
    /// null.
    pub fn flatten(
        &self,
        item: &Value,
        parent: Option<&Value>,
        contexts: &[&Value],
    ) -> Option<FlatRecord> {
        let values: Vec<FlatValue> = self
            .fields
            .iter()
            .map(|field| {
                let raw = match field.source {
                    FieldSource::ParentOverride => parent.or_else(|| lookup(item, field)),
                    FieldSource::Context1 => match contexts.first() {
                        Some(ctx) => lookup(ctx, field),
                        None => lookup(item, field),
                    },
                    FieldSource::Context2 => match contexts.get(1) {
                        Some(ctx) => lookup(ctx, field),
                        None => lookup(item, field),
                    },
                    FieldSource::Base => lookup(item, field),
                };
                self.convert(raw, field.is_date)
            })
            .collect();

        if values.iter().all(FlatValue::is_null) {
            return None;
        }

        Some(FlatRecord(values))
    }

    fn convert(&self, raw: Option<&Value>, is_date: bool) -> FlatValue {
        match raw {
            None => FlatValue::Null,
            Some(value) if is_date => value
                .as_str()
                .and_then(|s| self.date_format.normalize(s))
                .map(FlatValue::Date)
                .unwrap_or(FlatValue::Null),
            Some(value) => FlatValue::from_json(value),
        }
    }
}

fn lookup<'a>(item: &'a Value, field: &PlannedField) -> Option<&'a Value> {
    let object = item.as_object()?;
    if let Some(value) = object.get(&field.name) {
        return Some(value);
    }
    if field.path.len() < 2 {
        return None;
    }

    field
        .path
        .iter()
        .try_fold(item, |current, segment| current.as_object()?.get(segment))
}

/// Builder for [`FieldPlan`]
pub struct FieldPlanBuilder<'a> {
    fields: &'a [String],
    date_fields: Option<&'a BTreeSet<String>>,
    parent: Option<&'a str>,
    contexts: Vec<&'a [String]>,
    date_format: DateFormat,
    separator: String,
}

impl<'a> FieldPlanBuilder<'a> {
    pub fn date_fields(mut self, date_fields: &'a BTreeSet<String>) -> Self {
        self.date_fields = Some(date_fields);
        self
    }

    pub fn parent_override(mut self, field: &'a str) -> Self {
        self.parent = Some(field);
        self
    }

    /// Add the next context level's field subset (nearest first)
    pub fn context(mut self, fields: &'a [String]) -> Self {
        self.contexts.push(fields);
        self
    }

    pub fn date_format(mut self, format: DateFormat) -> Self {
        self.date_format = format;
        self
    }

    pub fn path_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn build(self) -> Result<FieldPlan, PlanError> {
        if self.fields.is_empty() {
            return Err(PlanError::EmptyFieldList);
        }
        if self.contexts.len() > MAX_CONTEXTS {
            return Err(PlanError::TooManyContexts(self.contexts.len()));
        }

        let mut parent_used = false;
        let fields = self
            .fields
            .iter()
            .map(|name| {
                let source = if !parent_used && self.parent == Some(name.as_str()) {
                    parent_used = true;
                    FieldSource::ParentOverride
                } else if self.contexts.first().is_some_and(|c| c.contains(name)) {
                    FieldSource::Context1
                } else if self.contexts.get(1).is_some_and(|c| c.contains(name)) {
                    FieldSource::Context2
                } else {
                    FieldSource::Base
                };

                let path = if self.separator.is_empty() {
                    vec![name.clone()]
                } else {
                    name.split(self.separator.as_str()).map(str::to_string).collect()
                };

                PlannedField {
                    name: name.clone(),
                    source,
                    path,
                    is_date: self.date_fields.is_some_and(|d| d.contains(name)),
                }
            })
            .collect();

        Ok(FieldPlan {
            fields,
            date_format: self.date_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn names(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_all_null_is_suppressed() {
        let fields = names(&["id", "name"]);
        let plan = FieldPlan::builder(&fields).build().unwrap();

        assert_eq!(plan.flatten(&json!({"id": null, "name": null}), None, &[]), None);
        assert_eq!(plan.flatten(&json!({}), None, &[]), None);
    }

    #[test]
    fn test_parent_override_applies_once() {
        let fields = names(&["parent_id", "parent_id"]);
        let plan = FieldPlan::builder(&fields)
            .parent_override("parent_id")
            .build()
            .unwrap();

        let record = plan
            .flatten(&json!({"parent_id": "own"}), Some(&json!(42)), &[])
            .unwrap();
        assert_eq!(
            record.values(),
            &[FlatValue::Integer(42), FlatValue::Text("own".to_string())]
        );

        let record = plan.flatten(&json!({}), Some(&json!(42)), &[]).unwrap();
        assert_eq!(record.values(), &[FlatValue::Integer(42), FlatValue::Null]);
    }

    #[test]
    fn test_context_resolution_order() {
        let fields = names(&["SaleID", "Line", "Batch", "Serial"]);
        let ctx1 = names(&["Batch"]);
        let ctx2 = names(&["Serial", "Batch"]);
        let plan = FieldPlan::builder(&fields)
            .parent_override("SaleID")
            .context(&ctx1)
            .context(&ctx2)
            .build()
            .unwrap();

        assert_eq!(
            plan.sources(),
            vec![
                FieldSource::ParentOverride,
                FieldSource::Base,
                FieldSource::Context1,
                FieldSource::Context2
            ]
        );

        let item = json!({"Line": 1, "Batch": "item-batch", "Serial": "item-serial"});
        let first = json!({"Batch": "B-7"});
        let second = json!({"Serial": "S-9", "Batch": "ignored"});
        let record = plan
            .flatten(&item, Some(&json!("S-1")), &[&first, &second])
            .unwrap();

        assert_eq!(
            record.values(),
            &[
                FlatValue::Text("S-1".into()),
                FlatValue::Integer(1),
                FlatValue::Text("B-7".into()),
                FlatValue::Text("S-9".into()),
            ]
        );
    }

    #[test]
    fn test_path_lookup() {
        let fields = names(&["Contact_Name", "Contact_Address_City", "Total"]);
        let plan = FieldPlan::builder(&fields).path_separator("_").build().unwrap();

        let item = json!({
            "Contact": {"Name": "Acme", "Address": "flat"},
            "Total": 12.5
        });
        let record = plan.flatten(&item, None, &[]).unwrap();

        assert_eq!(
            record.values(),
            &[FlatValue::Text("Acme".into()), FlatValue::Null, FlatValue::Float(12.5)]
        );
    }

    #[test]
    fn test_literal_key_wins_over_path() {
        let fields = names(&["Tax.Rate"]);
        let plan = FieldPlan::builder(&fields).build().unwrap();

        let record = plan
            .flatten(&json!({"Tax.Rate": "15%", "Tax": {"Rate": "0%"}}), None, &[])
            .unwrap();
        assert_eq!(record.values(), &[FlatValue::Text("15%".into())]);
    }

    #[test]
    fn test_date_fields_are_normalized() {
        let fields = names(&["id", "Updated", "Due"]);
        let dates: BTreeSet<String> = names(&["Updated", "Due"]).into_iter().collect();
        let plan = FieldPlan::builder(&fields).date_fields(&dates).build().unwrap();

        let record = plan
            .flatten(&json!({"id": 1, "Updated": "05/03/2024", "Due": "soon"}), None, &[])
            .unwrap();

        assert_eq!(
            record.values(),
            &[
                FlatValue::Integer(1),
                FlatValue::Date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()),
                FlatValue::Null
            ]
        );
    }

    #[test]
    fn test_nested_json_is_kept_as_text() {
        let fields = names(&["Tags"]);
        let plan = FieldPlan::builder(&fields).build().unwrap();
        let record = plan.flatten(&json!({"Tags": ["a", "b"]}), None, &[]).unwrap();
        assert_eq!(record.values(), &[FlatValue::Text(r#"["a","b"]"#.into())]);
    }

    #[test]
    fn test_plan_errors() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(
            FieldPlan::builder(&empty).build().unwrap_err(),
            PlanError::EmptyFieldList
        );

        let fields = names(&["a"]);
        let err = FieldPlan::builder(&fields)
            .context(&fields)
            .context(&fields)
            .context(&fields)
            .build()
            .unwrap_err();
        assert_eq!(err, PlanError::TooManyContexts(3));
    }

    proptest! {
        #[test]
        fn prop_record_length_matches_plan(
            keys in proptest::collection::vec("[a-z]{1,6}", 1..8),
            present in proptest::collection::vec(any::<Option<i64>>(), 8),
        ) {
            let plan = FieldPlan::builder(&keys).build().unwrap();
            let mut item = serde_json::Map::new();
            for (key, value) in keys.iter().zip(present.iter()) {
                item.insert(key.clone(), value.map(Value::from).unwrap_or(Value::Null));
            }
            let item = Value::Object(item);

            match plan.flatten(&item, None, &[]) {
                Some(record) => {
                    prop_assert_eq!(record.len(), keys.len());
                    prop_assert!(record.values().iter().any(|v| !v.is_null()));
                }
                None => {
                    let all_null = keys.iter().all(|k| item[k].is_null());
                    prop_assert!(all_null);
                }
            }
        }
    }
}

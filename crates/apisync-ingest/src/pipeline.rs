//! Extraction and loading for one sync target
//!
//! Everything a target needs is fetched before anything is written. Parent
//! rows are loaded before their nested children.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::dates::{lower_bound, DateFormat, LOWER_BOUND_FORMAT};
use crate::flatten::{FieldPlan, FlatRecord, FlatValue};
use crate::loader::{LoadPlan, LoadReport, TableLayout, UpsertLoader};
use crate::source::{as_list, fetch_all, fetch_record, FetchRequest, RemoteSource};
use crate::store::QualifiedTable;
use crate::targets::{NestedContext, NestedSpec, SyncTarget, TargetMode};

/// How a source's targets are named, flattened and staged
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProfile {
    pub name: String,
    pub table_prefix: String,
    /// Stage every target of this source, whatever its own flag says
    pub always_staging: bool,
    pub date_format: DateFormat,
    pub path_separator: String,
}

impl SourceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_prefix: String::new(),
            always_staging: false,
            date_format: DateFormat::default(),
            path_separator: crate::flatten::DEFAULT_PATH_SEPARATOR.to_string(),
        }
    }

    pub fn uses_staging(&self, target: &SyncTarget) -> bool {
        (target.staging || self.always_staging) && target.mode() != TargetMode::Record
    }

    /// Tables whose constraints are toggled around a target's reload
    pub fn reload_tables(&self, target: &SyncTarget, layout: &TableLayout) -> Vec<QualifiedTable> {
        let tables = target.reload_tables(&self.table_prefix);
        let skip_parent = target.mode() == TargetMode::Record;
        tables
            .iter()
            .skip(usize::from(skip_parent))
            .map(|t| layout.target(t))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Full,
    /// Records changed within the last `days` days
    Incremental { days: u32 },
}

impl RunKind {
    pub fn is_incremental(&self) -> bool {
        matches!(self, RunKind::Incremental { .. })
    }
}

/// Outcome of one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetReport {
    pub source: String,
    pub endpoint: String,
    pub mode: TargetMode,
    pub fetched: usize,
    pub loads: Vec<LoadReport>,
}

impl TargetReport {
    pub fn committed_rows(&self) -> u64 {
        self.loads.iter().map(|l| l.committed_rows).sum()
    }

    pub fn skipped_batches(&self) -> usize {
        self.loads.iter().map(|l| l.skipped.len()).sum()
    }
}

/// Runs targets of one source
#[derive(Clone)]
pub struct TargetPipeline {
    profile: SourceProfile,
    source: Arc<dyn RemoteSource>,
    loader: Arc<UpsertLoader>,
    layout: TableLayout,
}

impl TargetPipeline {
    pub fn new(
        profile: SourceProfile,
        source: Arc<dyn RemoteSource>,
        loader: Arc<UpsertLoader>,
        layout: TableLayout,
    ) -> Self {
        Self {
            profile,
            source,
            loader,
            layout,
        }
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    #[instrument(skip_all, fields(source = %self.profile.name, endpoint = %target.endpoint))]
    pub async fn run(&self, target: &SyncTarget, kind: RunKind, now: DateTime<Utc>) -> Result<TargetReport> {
        let bound = match kind {
            RunKind::Full => None,
            RunKind::Incremental { days } => Some(lower_bound(now, days, target.first_of_month)),
        };
        let bound_text = bound.map(|b| b.format(LOWER_BOUND_FORMAT).to_string());
        let params = target.listing_params(bound_text.as_deref());

        let mut report = TargetReport {
            source: self.profile.name.clone(),
            endpoint: target.endpoint.clone(),
            mode: target.mode(),
            fetched: 0,
            loads: Vec::new(),
        };

        let listing = FetchRequest {
            endpoint: target.endpoint_id.as_deref().unwrap_or(&target.endpoint),
            list_field: target.list_field(),
            params: &params,
            since: bound_text.as_deref(),
        };

        match target.mode() {
            TargetMode::Table => {
                let items = fetch_all(self.source.as_ref(), &listing, target.paged).await;
                report.fetched = items.len();
                if let Some(load) = self.load_parents(target, &items).await? {
                    report.loads.push(load);
                }
            }
            TargetMode::Nested => {
                let items = fetch_all(self.source.as_ref(), &listing, target.paged).await;
                report.fetched = items.len();
                if let Some(load) = self.load_parents(target, &items).await? {
                    report.loads.push(load);
                }

                let id_field = target.id_field();
                let parents: Vec<(Option<&Value>, &Value)> =
                    items.iter().map(|item| (item.get(id_field), item)).collect();
                let scope = kind
                    .is_incremental()
                    .then(|| parents.iter().filter_map(|(id, _)| scope_id(*id)).collect());

                report.loads.extend(self.load_children(target, &parents, scope).await?);
            }
            TargetMode::Record => {
                let listed = fetch_all(self.source.as_ref(), &listing, target.paged).await;
                let since_date = bound.map(|b| b.date());
                let ids = self.select_ids(target, &listed, since_date);
                debug!(listed = listed.len(), selected = ids.len(), "Selected record identifiers");

                let by_id_params = target.by_id_params();
                let by_id = FetchRequest {
                    endpoint: &target.endpoint,
                    list_field: target.list_field(),
                    params: &by_id_params,
                    since: None,
                };
                let mut records = Vec::with_capacity(ids.len());
                for id in &ids {
                    records.push(
                        fetch_record(self.source.as_ref(), &by_id, target.id_field(), &id_text(id)).await,
                    );
                }
                report.fetched = records.len();

                let id_field = target.id_field();
                let parents: Vec<(Option<&Value>, &Value)> =
                    records.iter().map(|record| (record.get(id_field), record)).collect();
                let scope = kind
                    .is_incremental()
                    .then(|| ids.iter().filter_map(|id| scope_id(Some(*id))).collect());

                report.loads.extend(self.load_children(target, &parents, scope).await?);
            }
        }

        info!(
            fetched = report.fetched,
            committed = report.committed_rows(),
            skipped_batches = report.skipped_batches(),
            "Target synced"
        );
        Ok(report)
    }

    async fn load_parents(&self, target: &SyncTarget, items: &[Value]) -> Result<Option<LoadReport>> {
        let plan = FieldPlan::builder(&target.fields)
            .date_fields(&target.date_fields)
            .date_format(self.profile.date_format)
            .path_separator(self.profile.path_separator.clone())
            .build()
            .with_context(|| format!("Invalid field list for {}", target.endpoint))?;

        let records: Vec<FlatRecord> = items
            .iter()
            .filter_map(|item| plan.flatten(item, None, &[]))
            .collect();
        if records.is_empty() {
            info!("No records to load");
            return Ok(None);
        }

        let table = target.table_name(&self.profile.table_prefix);
        let load_plan = if self.profile.uses_staging(target) {
            self.layout.staged_plan(&table, target.columns(), &target.id_column())
        } else {
            self.layout.direct_plan(&table, target.columns())
        };

        let report = self
            .loader
            .load(&records, &load_plan)
            .await
            .with_context(|| format!("Failed to load {}", table))?;
        Ok(Some(report))
    }

    async fn load_children(
        &self,
        target: &SyncTarget,
        parents: &[(Option<&Value>, &Value)],
        scope: Option<Vec<FlatValue>>,
    ) -> Result<Vec<LoadReport>> {
        let parent_table = target.table_name(&self.profile.table_prefix);
        let mut reports = Vec::new();

        for nested in &target.nested {
            let records = self.flatten_children(nested, parents)?;
            if records.is_empty() {
                if parents.is_empty() {
                    info!(nest = %nested.nest, "No nested records to load");
                    continue;
                }
                // Parents without children still clear their old child rows
                info!(nest = %nested.nest, parents = parents.len(), "Parents hold no nested records");
            }

            let table = nested.table_name(&parent_table);
            let mut plan: LoadPlan = self.layout.direct_plan(&table, nested.columns());
            if let Some(ids) = &scope {
                plan = plan.scoped(nested.parent_field(), ids.clone());
            }

            let report = self
                .loader
                .load(&records, &plan)
                .await
                .with_context(|| format!("Failed to load {}", table))?;
            reports.push(report);
        }

        Ok(reports)
    }

    fn flatten_children(
        &self,
        nested: &NestedSpec,
        parents: &[(Option<&Value>, &Value)],
    ) -> Result<Vec<FlatRecord>> {
        let contexts = nested.contexts();
        let mut builder = FieldPlan::builder(&nested.fields)
            .date_fields(&nested.date_fields)
            .parent_override(nested.parent_field())
            .date_format(self.profile.date_format)
            .path_separator(self.profile.path_separator.clone());
        for context in &contexts {
            builder = builder.context(&context.fields);
        }
        let plan = builder
            .build()
            .with_context(|| format!("Invalid field list for nested '{}'", nested.nest))?;

        let mut records = Vec::new();
        for (parent_id, parent) in parents {
            for child in as_list(parent.get(&nested.nest)) {
                for chain in context_chains(child, &contexts) {
                    if let Some(record) = plan.flatten(child, *parent_id, &chain) {
                        records.push(record);
                    }
                }
            }
        }
        Ok(records)
    }

    /// Identifiers of listed items, filtered by modification date when given
    fn select_ids<'a>(
        &self,
        target: &SyncTarget,
        listed: &'a [Value],
        since: Option<NaiveDate>,
    ) -> Vec<&'a Value> {
        let list_id = target.list_id.as_deref().unwrap_or_else(|| target.id_field());

        listed
            .iter()
            .filter(|item| match (since, target.list_date.as_deref()) {
                (Some(since), Some(date_field)) => item
                    .get(date_field)
                    .and_then(Value::as_str)
                    .and_then(|raw| self.profile.date_format.normalize(raw))
                    .is_none_or(|changed| changed >= since),
                _ => true,
            })
            .filter_map(|item| item.get(list_id))
            .filter(|id| !id.is_null())
            .collect()
    }
}

/// Every combination of context items below `child`, nearest level first
fn context_chains<'a>(child: &'a Value, contexts: &[&NestedContext]) -> Vec<Vec<&'a Value>> {
    let mut chains: Vec<Vec<&'a Value>> = vec![Vec::new()];

    for context in contexts {
        chains = chains
            .into_iter()
            .flat_map(|chain| {
                let holder = chain.last().copied().unwrap_or(child);
                as_list(holder.get(&context.nest))
                    .into_iter()
                    .map(move |item| {
                        let mut next = chain.clone();
                        next.push(item);
                        next
                    })
            })
            .collect();
    }

    chains
}

fn scope_id(value: Option<&Value>) -> Option<FlatValue> {
    value.map(FlatValue::from_json).filter(|v| !v.is_null())
}

fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

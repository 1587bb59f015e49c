//! Run orchestration
//!
//! A run authenticates every source, prepares each target in configuration
//! order (empty its staging table, disable constraints), runs all targets
//! as concurrent tasks, waits for every one of them and finally re-enables
//! constraints in configuration order. A failing target never cancels its
//! siblings.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::constraints::{ConstraintToggler, ToggleFailure};
use crate::loader::{TableLayout, UpsertLoader};
use crate::pipeline::{RunKind, TargetPipeline, TargetReport};
use crate::schedule::{ScheduleSettings, WatchState, WatchStep};
use crate::settings::Settings;
use crate::source::HttpSource;
use crate::store::{PgStore, QualifiedTable, SyncStore};
use crate::targets::{load_targets, SyncTarget};

/// A source's pipeline and its targets, in configuration order
pub struct SourceRuntime {
    pub pipeline: TargetPipeline,
    pub targets: Vec<SyncTarget>,
}

#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub source: String,
    pub endpoint: String,
    pub result: std::result::Result<TargetReport, String>,
}

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetOutcome>,
    pub staging_failures: Vec<String>,
    pub constraint_failures: Vec<ToggleFailure>,
}

impl RunReport {
    pub fn failed_targets(&self) -> usize {
        self.targets.iter().filter(|t| t.result.is_err()).count()
    }

    pub fn committed_rows(&self) -> u64 {
        self.targets
            .iter()
            .filter_map(|t| t.result.as_ref().ok())
            .map(TargetReport::committed_rows)
            .sum()
    }

    pub fn skipped_batches(&self) -> usize {
        self.targets
            .iter()
            .filter_map(|t| t.result.as_ref().ok())
            .map(TargetReport::skipped_batches)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_targets() == 0
            && self.skipped_batches() == 0
            && self.staging_failures.is_empty()
            && self.constraint_failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub source: QualifiedTable,
    pub snapshot: QualifiedTable,
    pub result: std::result::Result<u64, String>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub snapshots: Vec<SnapshotOutcome>,
}

impl BackupReport {
    pub fn failures(&self) -> usize {
        self.snapshots.iter().filter(|s| s.result.is_err()).count()
    }
}

pub struct Orchestrator {
    store: Arc<dyn SyncStore>,
    layout: TableLayout,
    sources: Vec<SourceRuntime>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SyncStore>, layout: TableLayout, sources: Vec<SourceRuntime>) -> Self {
        Self {
            store,
            layout,
            sources,
        }
    }

    /// Connect to PostgreSQL and build every configured source
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let db = &settings.database;
        let store: Arc<dyn SyncStore> = Arc::new(
            PgStore::connect(
                &db.url,
                db.max_connections,
                Duration::from_secs(db.connect_timeout_secs),
            )
            .await
            .context("Failed to connect to database")?,
        );
        Self::with_store(settings, store)
    }

    /// Build every configured source on top of an existing store
    pub fn with_store(settings: &Settings, store: Arc<dyn SyncStore>) -> Result<Self> {
        let evolution = settings
            .loader
            .schema_evolution
            .build(settings.loader.widening);
        let loader = Arc::new(UpsertLoader::new(
            store.clone(),
            evolution,
            settings.loader.batch_size,
        ));

        let mut sources = Vec::with_capacity(settings.sources.len());
        for source in &settings.sources {
            let targets = load_targets(&source.targets).with_context(|| {
                format!("Failed to load targets of source '{}'", source.name)
            })?;
            let http = Arc::new(HttpSource::new(&source.name, source.connection.clone())?);
            info!(source = %source.name, targets = targets.len(), "Source configured");

            sources.push(SourceRuntime {
                pipeline: TargetPipeline::new(
                    source.profile(),
                    http,
                    loader.clone(),
                    settings.layout.clone(),
                ),
                targets,
            });
        }

        Ok(Self::new(store, settings.layout.clone(), sources))
    }

    pub fn target_count(&self) -> usize {
        self.sources.iter().map(|s| s.targets.len()).sum()
    }

    /// Run every target once
    pub async fn run(&self, kind: RunKind) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, kind = ?kind);
        self.run_inner(run_id, kind).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, kind: RunKind) -> RunReport {
        let started_at = Utc::now();
        info!(targets = self.target_count(), "Starting run");

        for runtime in &self.sources {
            runtime.pipeline.source().authenticate().await;
        }

        let toggler = ConstraintToggler::new(self.store.clone());
        let mut staging_failures = Vec::new();
        let mut windows: Vec<QualifiedTable> = Vec::new();
        let mut constraint_failures = Vec::new();

        for runtime in &self.sources {
            let profile = runtime.pipeline.profile();
            for target in &runtime.targets {
                if profile.uses_staging(target) {
                    let staging = self.layout.staging(&target.table_name(&profile.table_prefix));
                    if let Err(e) = self.store.truncate(&staging).await {
                        warn!(table = %staging, error = %e, "Failed to empty staging table");
                        staging_failures.push(format!("{}: {}", staging, e));
                    }
                }

                let tables = profile.reload_tables(target, &self.layout);
                constraint_failures.extend(toggler.disable(&tables).await);
                windows.extend(tables);
            }
        }

        let mut handles = Vec::with_capacity(self.target_count());
        for runtime in &self.sources {
            for target in &runtime.targets {
                let pipeline = runtime.pipeline.clone();
                let task_target = target.clone();
                let handle = tokio::spawn(
                    async move { pipeline.run(&task_target, kind, started_at).await }.in_current_span(),
                );
                handles.push((runtime.pipeline.profile().name.clone(), target.endpoint.clone(), handle));
            }
        }

        let (labels, joins): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .map(|(source, endpoint, handle)| ((source, endpoint), handle))
            .unzip();
        let results = futures::future::join_all(joins).await;

        let targets: Vec<TargetOutcome> = labels
            .into_iter()
            .zip(results)
            .map(|((source, endpoint), joined)| {
                let result = match joined {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => {
                        error!(source = %source, endpoint = %endpoint, error = %format!("{:#}", e), "Target failed");
                        Err(format!("{:#}", e))
                    }
                    Err(e) => {
                        error!(source = %source, endpoint = %endpoint, error = %e, "Target task panicked");
                        Err(format!("task failed: {}", e))
                    }
                };
                TargetOutcome {
                    source,
                    endpoint,
                    result,
                }
            })
            .collect();

        constraint_failures.extend(toggler.enable(&windows).await);

        let report = RunReport {
            run_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            targets,
            staging_failures,
            constraint_failures,
        };

        info!(
            failed_targets = report.failed_targets(),
            committed = report.committed_rows(),
            skipped_batches = report.skipped_batches(),
            elapsed_secs = (report.finished_at - report.started_at).num_seconds(),
            "Run complete"
        );
        report
    }

    /// Refresh the snapshot of every table flagged for backup
    pub async fn backup(&self) -> BackupReport {
        let mut report = BackupReport::default();

        for runtime in &self.sources {
            let prefix = &runtime.pipeline.profile().table_prefix;
            for target in &runtime.targets {
                let table = target.table_name(prefix);
                let mut flagged = Vec::new();
                if target.backup {
                    flagged.push(table.clone());
                }
                flagged.extend(
                    target
                        .nested
                        .iter()
                        .filter(|n| n.backup)
                        .map(|n| n.table_name(&table)),
                );

                for name in flagged {
                    let source = self.layout.target(&name);
                    let snapshot = self.layout.backup(&name);
                    let result = self
                        .store
                        .snapshot(&source, &snapshot)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        warn!(table = %source, snapshot = %snapshot, error = %e, "Backup failed");
                    }
                    report.snapshots.push(SnapshotOutcome {
                        source,
                        snapshot,
                        result,
                    });
                }
            }
        }

        info!(
            tables = report.snapshots.len(),
            failed = report.failures(),
            "Backup complete"
        );
        report
    }

    /// Sync inside the active window and back up at night, forever
    pub async fn watch(&self, schedule: &ScheduleSettings) {
        let mut state = WatchState::default();
        info!(
            interval_mins = schedule.interval_mins,
            days = schedule.days,
            "Watching"
        );

        loop {
            match state.next(schedule, Local::now().naive_local()) {
                WatchStep::Sync => {
                    let report = self.run(RunKind::Incremental { days: schedule.days }).await;
                    if !report.is_clean() {
                        warn!(run_id = %report.run_id, "Run finished with failures");
                    }
                    tokio::time::sleep(schedule.interval()).await;
                }
                WatchStep::Backup => {
                    self.backup().await;
                }
                WatchStep::Idle => tokio::time::sleep(schedule.interval()).await,
            }
        }
    }
}

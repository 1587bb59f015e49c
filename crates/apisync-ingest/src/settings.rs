//! Run settings
//!
//! Loaded from a TOML file, then overridden by `APISYNC_`-prefixed
//! environment variables (`__` separates nested keys, so
//! `APISYNC_DATABASE__URL` sets `database.url`). `DATABASE_URL` is honoured
//! as well. A `.env` file in the working directory is read first.

use anyhow::Context;
use apisync_common::SyncError;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::dates::DateFormat;
use crate::flatten::DEFAULT_PATH_SEPARATOR;
use crate::loader::{EvolutionStrategy, TableLayout, WideningPolicy, DEFAULT_BATCH_SIZE};
use crate::pipeline::SourceProfile;
use crate::schedule::ScheduleSettings;
use crate::source::HttpSourceConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "apisync.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "APISYNC_";

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/apisync";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

fn default_path_separator() -> String {
    DEFAULT_PATH_SEPARATOR.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub layout: TableLayout,
    pub loader: LoaderSettings,
    pub schedule: ScheduleSettings,
    pub sources: Vec<SourceSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderSettings {
    pub batch_size: usize,
    pub schema_evolution: EvolutionStrategy,
    pub widening: WideningPolicy,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            schema_evolution: EvolutionStrategy::default(),
            widening: WideningPolicy::default(),
        }
    }
}

/// One remote source and the document listing its targets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    pub name: String,
    /// Target document; relative paths resolve against the settings file
    pub targets: PathBuf,
    #[serde(default)]
    pub table_prefix: String,
    #[serde(default)]
    pub always_staging: bool,
    #[serde(default)]
    pub date_format: DateFormat,
    #[serde(default = "default_path_separator")]
    pub path_separator: String,
    pub connection: HttpSourceConfig,
}

impl SourceSettings {
    pub fn profile(&self) -> SourceProfile {
        SourceProfile {
            name: self.name.clone(),
            table_prefix: self.table_prefix.clone(),
            always_staging: self.always_staging,
            date_format: self.date_format,
            path_separator: self.path_separator.clone(),
        }
    }
}

impl Settings {
    /// Load settings from `path` and the environment
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        if !path.exists() {
            anyhow::bail!("Settings file {} does not exist", path.display());
        }

        let mut settings: Settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw().only(&["database_url"]).map(|_| "database.url".into()))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
            .extract()
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut settings.sources {
            if source.targets.is_relative() {
                source.targets = base.join(&source.targets);
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Keep only the named source
    pub fn select_source(&mut self, name: &str) -> apisync_common::Result<()> {
        if !self.sources.iter().any(|s| s.name == name) {
            return Err(SyncError::UnknownSource(name.to_string()));
        }
        self.sources.retain(|s| s.name == name);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.loader.batch_size == 0 {
            anyhow::bail!("Loader batch_size must be greater than 0");
        }
        if self.loader.widening.step == 0 {
            anyhow::bail!("Loader widening step must be greater than 0");
        }
        if self.layout.target_schema == self.layout.staging_schema {
            anyhow::bail!(
                "Staging schema must differ from the target schema ('{}')",
                self.layout.target_schema
            );
        }
        self.schedule.validate()?;

        if self.sources.is_empty() {
            anyhow::bail!("At least one source must be configured");
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                anyhow::bail!("Source name cannot be empty");
            }
            if !names.insert(source.name.as_str()) {
                anyhow::bail!("Source '{}' is configured twice", source.name);
            }
            source
                .connection
                .validate()
                .with_context(|| format!("Invalid source '{}'", source.name))?;
        }

        Ok(())
    }
}

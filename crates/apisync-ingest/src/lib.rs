//! apisync ingest library
//!
//! Pulls paginated, nested JSON records from remote APIs, flattens them into
//! rows and loads them into PostgreSQL.
//!
//! # Components
//!
//! - **Flattening** ([`flatten`]): nested items to positional rows through a
//!   precompiled [`flatten::FieldPlan`]
//! - **Sources** ([`source`]): count, page and by-id fetches retried with
//!   capped backoff ([`retry`])
//! - **Loading** ([`loader`]): batched inserts with column widening on
//!   truncation, staging merges and scoped reloads
//! - **Orchestration** ([`orchestrator`]): concurrent targets bracketed by
//!   constraint toggling ([`constraints`])
//!
//! # Example
//!
//! ```no_run
//! use apisync_ingest::orchestrator::Orchestrator;
//! use apisync_ingest::pipeline::RunKind;
//! use apisync_ingest::settings::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load("apisync.toml".as_ref())?;
//!     let orchestrator = Orchestrator::from_settings(&settings).await?;
//!     let report = orchestrator.run(RunKind::Incremental { days: 1 }).await;
//!     println!("{} rows committed", report.committed_rows());
//!     Ok(())
//! }
//! ```

pub mod constraints;
pub mod dates;
pub mod flatten;
pub mod loader;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod schedule;
pub mod settings;
pub mod source;
pub mod store;
pub mod targets;

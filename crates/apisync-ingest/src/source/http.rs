//! JSON-over-HTTP source driven by configuration

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::{AuthConfig, Authenticator};
use super::{as_list, FetchMode, FetchRequest, Fetched, RemoteSource, SourceError};
use crate::retry::BackoffPolicy;

/// Default number of items requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// Default client-wide request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default media type a response must declare
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

pub const DEFAULT_TOTAL_POINTER: &str = "/Total";
pub const DEFAULT_PAGE_COUNT_POINTER: &str = "/pagination/pageCount";
pub const DEFAULT_SINCE_HEADER: &str = "If-Modified-Since";

fn default_total_pointer() -> String {
    DEFAULT_TOTAL_POINTER.to_string()
}

fn default_page_count_pointer() -> String {
    DEFAULT_PAGE_COUNT_POINTER.to_string()
}

fn default_since_header() -> String {
    DEFAULT_SINCE_HEADER.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

/// How the number of pages of a listing is learned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum CountStrategy {
    /// The source reports a total item count; a one-item page is requested
    TotalItems {
        #[serde(default = "default_total_pointer")]
        pointer: String,
    },
    /// The source reports the page count for the configured page size
    PageCount {
        #[serde(default = "default_page_count_pointer")]
        pointer: String,
    },
}

impl Default for CountStrategy {
    fn default() -> Self {
        CountStrategy::TotalItems {
            pointer: default_total_pointer(),
        }
    }
}

/// Names of the paging query parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagingConfig {
    pub page_param: String,
    pub size_param: String,
    pub page_size: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_param: "Page".to_string(),
            size_param: "Limit".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// How the incremental lower bound travels to the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SinceStrategy {
    /// Only through `__DATE__` query templates
    #[default]
    None,
    Header {
        #[serde(default = "default_since_header")]
        name: String,
    },
    QueryParam { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSourceConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub count: CountStrategy,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub since: SinceStrategy,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: AuthConfig::default(),
            count: CountStrategy::default(),
            paging: PagingConfig::default(),
            since: SinceStrategy::default(),
            backoff: BackoffPolicy::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("Source base_url cannot be empty");
        }
        if self.paging.page_size == 0 {
            anyhow::bail!("Source page_size must be greater than 0");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("Source timeout_secs must be greater than 0");
        }
        if self.backoff.step.is_zero() {
            anyhow::bail!("Source backoff step must be greater than 0");
        }
        Ok(())
    }
}

/// A configured JSON API
pub struct HttpSource {
    name: String,
    config: HttpSourceConfig,
    client: Client,
    auth: Authenticator,
}

impl HttpSource {
    pub fn new(name: impl Into<String>, config: HttpSourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let auth = Authenticator::new(config.auth.clone());

        Ok(Self {
            name: name.into(),
            config,
            client,
            auth,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn query(&self, request: &FetchRequest<'_>, mode: &FetchMode) -> Vec<(String, String)> {
        let paging = &self.config.paging;
        let mut query = match mode {
            FetchMode::Count => {
                let size = match self.config.count {
                    CountStrategy::TotalItems { .. } => 1,
                    CountStrategy::PageCount { .. } => paging.page_size,
                };
                vec![
                    (paging.page_param.clone(), "1".to_string()),
                    (paging.size_param.clone(), size.to_string()),
                ]
            }
            FetchMode::Page(page) => vec![
                (paging.page_param.clone(), page.to_string()),
                (paging.size_param.clone(), paging.page_size.to_string()),
            ],
            FetchMode::Unpaged => Vec::new(),
            FetchMode::ById { key, id } => vec![(key.clone(), id.clone())],
        };

        query.extend(request.params.iter().cloned());
        if let (SinceStrategy::QueryParam { name }, Some(since)) = (&self.config.since, request.since) {
            query.push((name.clone(), since.to_string()));
        }
        query
    }

    async fn attempt(
        &self,
        url: &str,
        query: &[(String, String)],
        since: Option<&str>,
    ) -> Result<Value, SourceError> {
        let mut builder = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/json");
        for (name, value) in self.auth.headers(&self.client, &self.config.backoff).await {
            builder = builder.header(name, value);
        }
        if let (SinceStrategy::Header { name }, Some(since)) = (&self.config.since, since) {
            builder = builder.header(name.as_str(), since);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !media_type_matches(&content_type, &self.config.content_type) {
            return Err(SourceError::ContentType {
                url: url.to_string(),
                found: content_type,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| SourceError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    fn interpret(&self, body: Value, request: &FetchRequest<'_>, mode: &FetchMode) -> Fetched {
        match mode {
            FetchMode::Count => Fetched::PageCount(self.page_count(&body, request.endpoint)),
            FetchMode::Page(_) | FetchMode::Unpaged => {
                let items = match &body {
                    Value::Array(items) => items.clone(),
                    _ => as_list(body.get(request.list_field))
                        .into_iter()
                        .cloned()
                        .collect(),
                };
                Fetched::Items(items)
            }
            FetchMode::ById { .. } => Fetched::Record(body),
        }
    }

    fn page_count(&self, body: &Value, endpoint: &str) -> u32 {
        let (pointer, reported) = match &self.config.count {
            CountStrategy::TotalItems { pointer } => (pointer, body.pointer(pointer).and_then(as_count)),
            CountStrategy::PageCount { pointer } => (pointer, body.pointer(pointer).and_then(as_count)),
        };

        let Some(reported) = reported else {
            warn!(source = %self.name, endpoint, pointer = %pointer, "Count missing from response, assuming no pages");
            return 0;
        };

        match self.config.count {
            CountStrategy::TotalItems { .. } => pages_for(reported, self.config.paging.page_size),
            CountStrategy::PageCount { .. } => u32::try_from(reported).unwrap_or(u32::MAX),
        }
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self) {
        self.auth.refresh(&self.client, &self.config.backoff).await;
    }

    async fn fetch(&self, request: &FetchRequest<'_>, mode: FetchMode) -> Fetched {
        let url = self.url(request.endpoint);
        let query = self.query(request, &mode);
        debug!(source = %self.name, url = %url, mode = ?mode, "Fetching");

        let what = format!("{} {}", self.name, request.endpoint);
        let body = self
            .config
            .backoff
            .retry_forever(&what, || self.attempt(&url, &query, request.since))
            .await;

        self.interpret(body, request, &mode)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.ceil() as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Pages needed for `total` items at `page_size` items per page
pub fn pages_for(total: u64, page_size: u32) -> u32 {
    let pages = total.div_ceil(u64::from(page_size.max(1)));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

fn media_type_matches(header: &str, expected: &str) -> bool {
    header
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|media| media.eq_ignore_ascii_case(expected))
}

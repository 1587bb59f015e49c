//! Remote sources
//!
//! A [`RemoteSource`] answers three kinds of request: how many pages a
//! listing has, one page of items, and one record by identifier. Transient
//! failures never reach the caller; implementations retry them with a
//! [`BackoffPolicy`](crate::retry::BackoffPolicy) until they succeed.

pub mod auth;
pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use auth::{AuthConfig, Authenticator};
pub use http::{CountStrategy, HttpSource, HttpSourceConfig, PagingConfig, SinceStrategy};

/// Transient failures of a single remote call
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned content type '{found}'")]
    ContentType { url: String, found: String },

    #[error("{url} returned an undecodable body: {reason}")]
    Decode { url: String, reason: String },

    #[error("token response is missing '{0}'")]
    MissingCredential(String),
}

/// What a fetch asks for
#[derive(Debug, Clone, PartialEq)]
pub enum FetchMode {
    /// Number of pages in the listing
    Count,
    /// One page of the listing, numbered from 1
    Page(u32),
    /// The whole listing in one un-paged call
    Unpaged,
    /// One record, selected by the `key` query parameter
    ById { key: String, id: String },
}

/// One fetch against a listing endpoint
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub endpoint: &'a str,
    /// Response key holding the item array
    pub list_field: &'a str,
    pub params: &'a [(String, String)],
    /// Incremental lower bound, sent the way the source expects
    pub since: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    PageCount(u32),
    Items(Vec<Value>),
    Record(Value),
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire or refresh credentials; a no-op for static credentials
    async fn authenticate(&self);

    async fn fetch(&self, request: &FetchRequest<'_>, mode: FetchMode) -> Fetched;
}

/// Fetch every item of a listing
///
/// Paged listings are counted first and then read page by page; every page
/// is fetched before this returns.
pub async fn fetch_all(
    source: &dyn RemoteSource,
    request: &FetchRequest<'_>,
    paged: bool,
) -> Vec<Value> {
    if !paged {
        return items_of(source, request, FetchMode::Unpaged).await;
    }

    let pages = match source.fetch(request, FetchMode::Count).await {
        Fetched::PageCount(pages) => pages,
        other => {
            warn!(endpoint = request.endpoint, response = ?other, "Count request returned no page count");
            0
        }
    };
    debug!(source = source.name(), endpoint = request.endpoint, pages, "Listing pages");

    let mut items = Vec::new();
    for page in 1..=pages {
        items.extend(items_of(source, request, FetchMode::Page(page)).await);
    }
    items
}

async fn items_of(source: &dyn RemoteSource, request: &FetchRequest<'_>, mode: FetchMode) -> Vec<Value> {
    match source.fetch(request, mode).await {
        Fetched::Items(items) => items,
        Fetched::Record(record) => vec![record],
        Fetched::PageCount(_) => Vec::new(),
    }
}

/// Fetch one record by identifier
pub async fn fetch_record(
    source: &dyn RemoteSource,
    request: &FetchRequest<'_>,
    key: &str,
    id: &str,
) -> Value {
    let mode = FetchMode::ById {
        key: key.to_string(),
        id: id.to_string(),
    };
    match source.fetch(request, mode).await {
        Fetched::Record(record) => record,
        Fetched::Items(mut items) if items.len() == 1 => items.remove(0),
        Fetched::Items(items) => Value::Array(items),
        Fetched::PageCount(_) => Value::Null,
    }
}

/// Treat a single value as a one-element list; null and missing become empty
pub fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}

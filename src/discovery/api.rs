//! Search API dialects.
//!
//! v2 is the default (no auth, 100 results per page); v1 stays available
//! because its topic filtering differs and operators sometimes need it for
//! completeness.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::FetchError;
use crate::rate::{RatePolicy, RequestClass, RetryPolicy};
use crate::session::SessionClient;

/// One raw search result as the provider returns it. Fields the filter and
/// the manifest need; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub title: String,
    pub archive_id: Option<String>,
    pub isbn: Option<String>,
    pub ourn: Option<String>,
    pub format: Option<String>,
    pub language: Option<String>,
    /// Subject labels; the provider emits plain strings or `{name}` objects
    /// depending on dialect.
    pub subjects: Vec<serde_json::Value>,
    /// Topic labels, same looseness as `subjects`.
    pub topics: Vec<serde_json::Value>,
    /// Book-info URL when the provider supplies one.
    pub url: Option<String>,
}

impl SearchResult {
    /// The opaque book id: `archive_id`, else `isbn`, else `ourn`.
    #[must_use]
    pub fn book_id(&self) -> Option<String> {
        for candidate in [&self.archive_id, &self.isbn, &self.ourn] {
            if let Some(id) = candidate
                && !id.trim().is_empty()
            {
                return Some(id.trim().to_string());
            }
        }
        None
    }

    /// All subject/topic labels, flattened to lowercase strings.
    #[must_use]
    pub fn topic_labels(&self) -> Vec<String> {
        self.subjects
            .iter()
            .chain(self.topics.iter())
            .filter_map(|value| match value {
                serde_json::Value::String(label) => Some(label.clone()),
                serde_json::Value::Object(object) => object
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string),
                _ => None,
            })
            .map(|label| label.to_lowercase())
            .collect()
    }
}

/// One page of search results, normalized across dialects.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchPage {
    pub results: Vec<SearchResult>,
    /// v2 only: total matching items.
    pub total: Option<u64>,
    /// v2 only: URL of the next page, `null` on the last one.
    pub next: Option<String>,
    /// v1 only: whether the result set is complete.
    pub complete: Option<bool>,
}

/// A search API dialect: how pages are addressed, fetched, and chained.
#[async_trait]
pub trait SearchDialect: Send + Sync {
    /// Effective results per page, for the page-budget estimate.
    fn page_size(&self) -> u64;

    /// Index of the first page (0 for v2, 1 for v1).
    fn first_page(&self) -> u32;

    /// Fetches one page, paced and retried.
    async fn fetch_page(
        &self,
        session: &SessionClient,
        rate: &RatePolicy,
        retry: &RetryPolicy,
        topic: &str,
        page: u32,
    ) -> Result<SearchPage, FetchError>;

    /// Whether the API reports more pages after this one.
    fn has_next(&self, page: &SearchPage) -> bool;
}

/// v1 dialect: authenticated, `?q={topic}&rows=100&page={1..}`, result
/// buckets of ~15 items, completion flag in the body.
#[derive(Debug)]
pub struct V1Search {
    base_url: String,
}

impl V1Search {
    /// Creates the dialect against a provider origin.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn page_url(&self, topic: &str, page: u32) -> Result<String, FetchError> {
        let mut url = Url::parse(&format!("{}/api/v1/search", self.base_url))
            .map_err(|e| FetchError::parse(&self.base_url, e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", topic)
            .append_pair("rows", "100")
            .append_pair("page", &page.to_string());
        Ok(url.into())
    }
}

#[async_trait]
impl SearchDialect for V1Search {
    fn page_size(&self) -> u64 {
        15
    }

    fn first_page(&self) -> u32 {
        1
    }

    async fn fetch_page(
        &self,
        session: &SessionClient,
        rate: &RatePolicy,
        retry: &RetryPolicy,
        topic: &str,
        page: u32,
    ) -> Result<SearchPage, FetchError> {
        let url = self.page_url(topic, page)?;
        session
            .get_json_retrying(&url, rate, RequestClass::Discovery, retry)
            .await
    }

    fn has_next(&self, page: &SearchPage) -> bool {
        !page.complete.unwrap_or(false) && !page.results.is_empty()
    }
}

/// v2 dialect: unauthenticated, `?query=*&topics={topic}&limit=100`,
/// 0-indexed pages, `total`/`next` signals.
#[derive(Debug)]
pub struct V2Search {
    base_url: String,
}

impl V2Search {
    /// Creates the dialect against a provider origin.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn page_url(&self, topic: &str, page: u32) -> Result<String, FetchError> {
        let mut url = Url::parse(&format!("{}/api/v2/search", self.base_url))
            .map_err(|e| FetchError::parse(&self.base_url, e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("query", "*")
            .append_pair("topics", topic)
            .append_pair("limit", "100")
            .append_pair("page", &page.to_string());
        Ok(url.into())
    }
}

#[async_trait]
impl SearchDialect for V2Search {
    fn page_size(&self) -> u64 {
        100
    }

    fn first_page(&self) -> u32 {
        0
    }

    async fn fetch_page(
        &self,
        session: &SessionClient,
        rate: &RatePolicy,
        retry: &RetryPolicy,
        topic: &str,
        page: u32,
    ) -> Result<SearchPage, FetchError> {
        let url = self.page_url(topic, page)?;
        session
            .get_json_retrying(&url, rate, RequestClass::Discovery, retry)
            .await
    }

    fn has_next(&self, page: &SearchPage) -> bool {
        page.next.is_some()
    }
}

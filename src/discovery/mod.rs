//! Discovery engine: per-topic search pagination, relevance filtering,
//! early stopping, and topic manifest output.
//!
//! For each topic the engine walks the search API until one of four
//! terminal conditions holds: the expected count is reached, three
//! consecutive pages yield zero accepted books, the API reports no further
//! pages, or the page budget is exhausted.

mod api;
mod filter;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub use api::{SearchDialect, SearchPage, SearchResult, V1Search, V2Search};
pub use filter::{RelevanceFilter, has_numeric_isbn, has_valid_isbn, skill_variants};

use crate::config::{ApiVersion, JobConfig};
use crate::error::FetchError;
use crate::naming::manifest_file_slug;
use crate::rate::{RatePolicy, RetryPolicy};
use crate::session::SessionClient;
use crate::topics::Topic;

/// Floor of the estimated page budget. Must exceed [`MAX_EMPTY_PAGES`] by
/// enough that a small topic can still end through the empty-page stop
/// rather than the budget.
const MIN_PAGE_BUDGET: u64 = 6;

/// Ceiling of the estimated page budget (the configured hard cap may be
/// lower).
const MAX_PAGE_BUDGET: u64 = 200;

/// Consecutive all-rejected pages that end a topic.
const MAX_EMPTY_PAGES: u32 = 3;

/// One discovered book as persisted in a topic manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRef {
    /// Book title as the search API reported it.
    pub title: String,
    /// Opaque provider book id; identity key for dedup and skipping.
    pub id: String,
    /// Book-info API URL.
    pub url: String,
    /// ISBN when known, else the book id (the provider interchanges them).
    pub isbn: String,
    /// Content format label.
    pub format: String,
}

/// The per-topic manifest written by discovery and consumed by downloads.
/// Written atomically; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicManifest {
    /// The topic this manifest belongs to.
    pub skill_name: String,
    /// When discovery ran.
    pub discovery_timestamp: DateTime<Utc>,
    /// Number of accepted books.
    pub total_books: u64,
    /// The accepted books, in acceptance order.
    pub books: Vec<BookRef>,
}

impl TopicManifest {
    /// Loads a manifest from disk.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Io`] when unreadable and [`FetchError::Parse`]
    /// when the JSON does not describe a manifest.
    pub fn load(path: &Path) -> Result<Self, FetchError> {
        let raw = std::fs::read_to_string(path).map_err(|e| FetchError::io(path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| FetchError::parse(path.display().to_string(), e.to_string()))
    }
}

/// Why pagination stopped for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The expected number of books was accepted.
    ExpectedReached,
    /// Three consecutive pages produced zero accepted books.
    EmptyPages,
    /// The API reported no further pages.
    ApiExhausted,
    /// The page budget ran out.
    BudgetExhausted,
    /// The per-topic book cap was hit.
    BookCapReached,
}

impl StopReason {
    fn label(self) -> &'static str {
        match self {
            Self::ExpectedReached => "expected count reached",
            Self::EmptyPages => "consecutive empty pages",
            Self::ApiExhausted => "no further pages",
            Self::BudgetExhausted => "page budget exhausted",
            Self::BookCapReached => "book cap reached",
        }
    }
}

/// Outcome of discovering one topic.
#[derive(Debug)]
pub struct DiscoveryOutcome {
    /// The manifest that was written.
    pub manifest: TopicManifest,
    /// Pages fetched.
    pub pages_fetched: u32,
    /// Why pagination stopped.
    pub stop_reason: StopReason,
}

/// The discovery engine for one job.
pub struct DiscoveryEngine {
    session: Arc<SessionClient>,
    rate: Arc<RatePolicy>,
    retry: RetryPolicy,
    dialect: Box<dyn SearchDialect>,
    base_url: String,
    output_dir: PathBuf,
    max_pages: u32,
    max_books: Option<usize>,
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("output_dir", &self.output_dir)
            .field("max_pages", &self.max_pages)
            .field("max_books", &self.max_books)
            .finish_non_exhaustive()
    }
}

impl DiscoveryEngine {
    /// Builds the engine from job configuration.
    #[must_use]
    pub fn from_config(
        config: &JobConfig,
        session: Arc<SessionClient>,
        rate: Arc<RatePolicy>,
    ) -> Self {
        let dialect: Box<dyn SearchDialect> = match config.discovery_api_version {
            ApiVersion::V1 => Box::new(V1Search::new(&config.base_url)),
            ApiVersion::V2 => Box::new(V2Search::new(&config.base_url)),
        };
        Self {
            session,
            rate,
            retry: RetryPolicy::default(),
            dialect,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            output_dir: config.book_ids_directory.clone(),
            max_pages: config.max_pages_per_skill,
            max_books: config.max_books_per_skill,
        }
    }

    /// Builds an engine with explicit parts (tests).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionClient>,
        rate: Arc<RatePolicy>,
        retry: RetryPolicy,
        dialect: Box<dyn SearchDialect>,
        base_url: &str,
        output_dir: PathBuf,
        max_pages: u32,
        max_books: Option<usize>,
    ) -> Self {
        Self {
            session,
            rate,
            retry,
            dialect,
            base_url: base_url.trim_end_matches('/').to_string(),
            output_dir,
            max_pages,
            max_books,
        }
    }

    /// Path of the manifest file for a topic.
    #[must_use]
    pub fn manifest_path(&self, topic_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_books.json", manifest_file_slug(topic_name)))
    }

    /// Whether a topic already has a manifest on disk.
    #[must_use]
    pub fn is_topic_discovered(&self, topic_name: &str) -> bool {
        self.manifest_path(topic_name).is_file()
    }

    /// Discovers all books for one topic and writes its manifest.
    ///
    /// # Errors
    ///
    /// Returns the fetch error that ended pagination (after retries) or an
    /// IO error from the manifest write. Either fails this topic only.
    #[instrument(skip(self), fields(topic = %topic.name))]
    pub async fn discover_topic(&self, topic: &Topic) -> Result<DiscoveryOutcome, FetchError> {
        // An expected count of zero is a hint with no information in it.
        let expected = topic.expected_count.filter(|e| *e > 0);
        let budget = self.page_budget(expected);
        let relevance = RelevanceFilter::new(&topic.name);

        info!(
            topic = %topic.name,
            expected = expected,
            budget,
            "discover: starting topic"
        );

        let mut books: Vec<BookRef> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut consecutive_empty: u32 = 0;
        let mut pages_fetched: u32 = 0;
        let mut page_index = self.dialect.first_page();

        let stop_reason = loop {
            let page = self
                .dialect
                .fetch_page(
                    self.session.as_ref(),
                    self.rate.as_ref(),
                    &self.retry,
                    &topic.name,
                    page_index,
                )
                .await?;
            pages_fetched += 1;

            let accepted_this_page =
                self.collect_page(&relevance, &topic.name, &page, &mut seen, &mut books);
            if accepted_this_page == 0 {
                consecutive_empty += 1;
            } else {
                consecutive_empty = 0;
            }

            if let Some(cap) = self.max_books
                && books.len() >= cap
            {
                books.truncate(cap);
                break StopReason::BookCapReached;
            }
            if let Some(expected) = expected
                && books.len() as u64 >= expected
            {
                break StopReason::ExpectedReached;
            }
            if consecutive_empty >= MAX_EMPTY_PAGES {
                break StopReason::EmptyPages;
            }
            if !self.dialect.has_next(&page) {
                break StopReason::ApiExhausted;
            }
            if pages_fetched >= budget {
                break StopReason::BudgetExhausted;
            }

            page_index += 1;
        };

        let manifest = TopicManifest {
            skill_name: topic.name.clone(),
            discovery_timestamp: Utc::now(),
            total_books: books.len() as u64,
            books,
        };
        self.write_manifest(&manifest)?;

        info!(
            topic = %topic.name,
            books = manifest.total_books,
            pages = pages_fetched,
            reason = stop_reason.label(),
            "discover: topic complete"
        );

        Ok(DiscoveryOutcome {
            manifest,
            pages_fetched,
            stop_reason,
        })
    }

    /// Filters one page into the accumulator; returns how many were
    /// accepted from it.
    fn collect_page(
        &self,
        relevance: &RelevanceFilter,
        topic_name: &str,
        page: &SearchPage,
        seen: &mut HashSet<String>,
        books: &mut Vec<BookRef>,
    ) -> usize {
        let mut accepted = 0;
        for result in &page.results {
            if !relevance.accept(result) {
                continue;
            }
            let Some(book_id) = result.book_id() else {
                continue;
            };
            if !seen.insert(book_id.clone()) {
                continue;
            }

            let isbn = result
                .isbn
                .as_deref()
                .filter(|isbn| has_valid_isbn(Some(isbn)))
                .unwrap_or(&book_id)
                .to_string();
            let url = result
                .url
                .clone()
                .unwrap_or_else(|| format!("{}/api/v1/book/{book_id}/", self.base_url));

            books.push(BookRef {
                title: result.title.trim().to_string(),
                id: book_id,
                url,
                isbn,
                format: result
                    .format
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| "book".to_string()),
            });
            accepted += 1;

            if let Some(cap) = self.max_books
                && books.len() >= cap
            {
                tracing::debug!(topic = topic_name, cap, "discover: book cap hit mid-page");
                break;
            }
        }
        accepted
    }

    /// `ceil(expected / page_size) + 2`, clamped to `[5, 200]` and the
    /// configured hard cap. Without an expected count, the hard cap is the
    /// budget.
    fn page_budget(&self, expected: Option<u64>) -> u32 {
        let budget = match expected {
            Some(expected) => {
                let page_size = self.dialect.page_size().max(1);
                (expected.div_ceil(page_size) + 2).clamp(MIN_PAGE_BUDGET, MAX_PAGE_BUDGET)
            }
            None => u64::from(self.max_pages),
        };
        u32::try_from(budget.min(u64::from(self.max_pages))).unwrap_or(self.max_pages)
    }

    /// Writes a manifest atomically: either complete or absent, never
    /// partial.
    fn write_manifest(&self, manifest: &TopicManifest) -> Result<(), FetchError> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| FetchError::io(&self.output_dir, e))?;

        let path = self.manifest_path(&manifest.skill_name);
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| FetchError::parse(path.display().to_string(), e.to_string()))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &body).map_err(|e| FetchError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| FetchError::io(&path, e))?;
        Ok(())
    }
}

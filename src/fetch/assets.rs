//! Asset downloads: images and stylesheets, serially, with independent
//! retries.
//!
//! An image that keeps failing is logged and skipped; the book still
//! builds. A stylesheet that keeps failing is omitted from the package
//! manifest rather than breaking it.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::rate::{RatePolicy, RequestClass, RetryDecision, RetryPolicy};
use crate::session::SessionClient;

/// One asset to fetch: source URL and its local filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// Absolute source URL.
    pub url: String,
    /// Filename under the book's `Images/` or `Styles/` directory.
    pub local_name: String,
}

/// Result of an image batch.
#[derive(Debug, Default)]
pub struct AssetReport {
    /// Assets written to disk.
    pub downloaded: usize,
    /// Assets already present and skipped.
    pub skipped: usize,
    /// URLs that failed after the retry budget.
    pub failed: Vec<String>,
}

/// Serial asset downloader sharing the job's session and pacing.
#[derive(Debug)]
pub struct AssetDownloader {
    session: Arc<SessionClient>,
    rate: Arc<RatePolicy>,
    retry: RetryPolicy,
}

impl AssetDownloader {
    /// Creates the downloader.
    #[must_use]
    pub fn new(session: Arc<SessionClient>, rate: Arc<RatePolicy>, retry: RetryPolicy) -> Self {
        Self {
            session,
            rate,
            retry,
        }
    }

    /// Downloads a set of images into `images_dir`, one at a time.
    ///
    /// Existing files are kept (a re-run never re-fetches what it already
    /// has). Failures are per-image: recorded and skipped, never fatal.
    pub async fn download_images(&self, entries: &[AssetEntry], images_dir: &Path) -> AssetReport {
        let mut report = AssetReport::default();

        for entry in entries {
            let target = images_dir.join(&entry.local_name);
            if target.is_file() {
                debug!(name = %entry.local_name, "skip: image already on disk");
                report.skipped += 1;
                continue;
            }

            match self.download_one(&entry.url, &target).await {
                Ok(bytes) => {
                    debug!(name = %entry.local_name, bytes, "download: image saved");
                    report.downloaded += 1;
                }
                Err(error) => {
                    warn!(
                        url = %entry.url,
                        error = %error,
                        "fail: image abandoned after retries; book will build without it"
                    );
                    report.failed.push(entry.url.clone());
                }
            }
        }

        report
    }

    /// Fetches one stylesheet as text, with retries.
    ///
    /// # Errors
    ///
    /// Returns the final fetch error; the caller omits the sheet from the
    /// package manifest.
    pub async fn fetch_stylesheet(&self, url: &str) -> Result<String, FetchError> {
        self.session
            .get_text_retrying(url, &self.rate, RequestClass::Asset, &self.retry)
            .await
    }

    /// Streams one asset to disk with the retry policy applied.
    async fn download_one(&self, url: &str, target: &Path) -> Result<u64, FetchError> {
        let mut attempt: u32 = 1;
        loop {
            self.rate.acquire(RequestClass::Asset).await;
            match self.session.download_to_file(url, target).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) => match self.retry.should_retry(&error, attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(
                            url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retry: asset fetch failed"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { .. } => return Err(error),
                },
            }
        }
    }
}

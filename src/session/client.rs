//! Authenticated HTTP session with in-band token rotation.
//!
//! The provider rotates its auth cookie on every response: each reply may
//! carry a `Set-Cookie` that replaces the token the next request must send.
//! [`SessionClient::get`] is therefore an atomic send → receive →
//! merge-cookies operation; by the time it returns, the jar already holds
//! every pair from the response's `Set-Cookie` headers. Ignoring rotations
//! deauthenticates the session within a handful of calls.
//!
//! One client, one jar, one pipeline. The session is never shared between
//! concurrent requests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderValue, RETRY_AFTER, SET_COOKIE};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::cookies::{CookieStore, CookieStoreError};
use crate::error::FetchError;
use crate::rate::{RatePolicy, RequestClass, RetryDecision, RetryPolicy};

/// Default connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Browser-like User-Agent; the provider rejects obvious bot agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Per-request options for [`SessionClient::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Per-request timeout override (replaces the read timeout).
    pub timeout: Option<Duration>,
    /// The caller expects JSON; an HTML reply means the session is dead.
    pub expect_json: bool,
}

impl GetOptions {
    /// Options for a JSON API request.
    #[must_use]
    pub fn json() -> Self {
        Self {
            expect_json: true,
            ..Self::default()
        }
    }
}

/// The process-wide authenticated HTTP session.
#[derive(Debug)]
pub struct SessionClient {
    client: reqwest::Client,
    cookies: Arc<CookieStore>,
    books_since_save: AtomicU32,
    token_save_interval: u32,
}

impl SessionClient {
    /// Creates the session around a loaded cookie jar.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    #[instrument(level = "debug", skip(cookies))]
    pub fn new(cookies: Arc<CookieStore>, token_save_interval: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");

        Self {
            client,
            cookies,
            books_since_save: AtomicU32::new(0),
            token_save_interval: token_save_interval.max(1),
        }
    }

    /// Returns the cookie store backing this session.
    #[must_use]
    pub fn cookies(&self) -> &Arc<CookieStore> {
        &self.cookies
    }

    /// Sends a GET request with the current cookies and merges every
    /// `Set-Cookie` pair from the response into the jar before returning.
    ///
    /// Status handling: 401/403 (and, for `expect_json` requests, an HTML
    /// content type) signal [`FetchError::AuthFailed`]; other non-2xx
    /// statuses are returned to the caller inside the response.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`]/[`FetchError::Timeout`] on network
    /// failure and [`FetchError::AuthFailed`] on a dead session.
    #[instrument(level = "debug", skip(self, options), fields(url = %url))]
    pub async fn get(
        &self,
        url: &str,
        options: &GetOptions,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url);

        if let Some(header) = self.cookies.cookie_header()
            && let Ok(value) = HeaderValue::from_bytes(header.as_bytes())
        {
            request = request.header(COOKIE, value);
        }
        if options.expect_json {
            request = request.header(reqwest::header::ACCEPT, "application/json");
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|source| FetchError::transport(url, source))?;

        // The sliding-token merge. This must happen on every response,
        // success or not, before anything else can issue a request.
        for header in response.headers().get_all(SET_COOKIE) {
            match std::str::from_utf8(header.as_bytes()) {
                Ok(value) => {
                    if let Some(name) = self.cookies.merge_set_cookie(value) {
                        debug!(cookie = %name, "merged rotated cookie");
                    }
                }
                Err(_) => warn!("skipping non-UTF-8 Set-Cookie header"),
            }
        }

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::auth_failed(url, Some(status.as_u16())));
        }
        if options.expect_json
            && status.is_success()
            && content_type_is_html(response.headers().get(CONTENT_TYPE))
        {
            return Err(FetchError::auth_failed(url, None));
        }

        Ok(response)
    }

    /// Fetches a JSON resource.
    ///
    /// # Errors
    ///
    /// Adds to [`get`](Self::get): [`FetchError::HttpStatus`] on non-2xx,
    /// [`FetchError::AuthFailed`] when the body is HTML despite a JSON
    /// content type, and [`FetchError::Parse`] on malformed JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.get(url, &GetOptions::json()).await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = header_string(response.headers().get(RETRY_AFTER));
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }

        let body = response
            .text()
            .await
            .map_err(|source| FetchError::transport(url, source))?;

        // A login interstitial served with a JSON content type still starts
        // with markup.
        if body.trim_start().starts_with('<') {
            return Err(FetchError::auth_failed(url, None));
        }

        serde_json::from_str(&body).map_err(|e| FetchError::parse(url, e.to_string()))
    }

    /// Fetches a text resource (chapter HTML, stylesheet).
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::HttpStatus`] on non-2xx in addition to the
    /// errors of [`get`](Self::get).
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url, &GetOptions::default()).await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = header_string(response.headers().get(RETRY_AFTER));
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }
        response
            .text()
            .await
            .map_err(|source| FetchError::transport(url, source))
    }

    /// Fetches a small binary resource fully into memory (cover probes).
    ///
    /// # Errors
    ///
    /// Same surface as [`get_text`](Self::get_text).
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url, &GetOptions::default()).await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = header_string(response.headers().get(RETRY_AFTER));
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::transport(url, source))?;
        Ok(bytes.to_vec())
    }

    /// Streams a binary resource to a file, returning the byte count.
    /// A partial file is removed when the stream fails midway.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::HttpStatus`] on non-2xx, [`FetchError::Io`]
    /// on write failure, and transport errors from the stream.
    #[instrument(level = "debug", skip(self), fields(url = %url, path = %path.display()))]
    pub async fn download_to_file(&self, url: &str, path: &Path) -> Result<u64, FetchError> {
        let response = self.get(url, &GetOptions::default()).await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = header_string(response.headers().get(RETRY_AFTER));
            return Err(FetchError::http_status(url, status.as_u16(), retry_after));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| FetchError::io(path, e))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(path).await;
                    return Err(FetchError::transport(url, source));
                }
            };
            if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                return Err(FetchError::io(path, e));
            }
            written += chunk.len() as u64;
        }

        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        Ok(written)
    }

    /// Fetches JSON with pacing and the retry policy applied.
    ///
    /// # Errors
    ///
    /// Returns the final error after the retry budget is exhausted, or
    /// immediately for non-retryable failures.
    pub async fn get_json_retrying<T: DeserializeOwned>(
        &self,
        url: &str,
        rate: &RatePolicy,
        class: RequestClass,
        retry: &RetryPolicy,
    ) -> Result<T, FetchError> {
        let mut attempt: u32 = 1;
        loop {
            rate.acquire(class).await;
            match self.get_json::<T>(url).await {
                Ok(value) => return Ok(value),
                Err(error) => match retry.should_retry(&error, attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(
                            url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retry: transient failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { .. } => return Err(error),
                },
            }
        }
    }

    /// Fetches text with pacing and the retry policy applied.
    ///
    /// # Errors
    ///
    /// Same contract as [`get_json_retrying`](Self::get_json_retrying).
    pub async fn get_text_retrying(
        &self,
        url: &str,
        rate: &RatePolicy,
        class: RequestClass,
        retry: &RetryPolicy,
    ) -> Result<String, FetchError> {
        let mut attempt: u32 = 1;
        loop {
            rate.acquire(class).await;
            match self.get_text(url).await {
                Ok(value) => return Ok(value),
                Err(error) => match retry.should_retry(&error, attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(
                            url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retry: transient failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { .. } => return Err(error),
                },
            }
        }
    }

    /// Records one successful book download, persisting the cookie jar
    /// every `token_save_interval` books. Returns whether a save happened.
    ///
    /// # Errors
    ///
    /// Returns the cookie-file write failure; callers treat this as fatal.
    pub async fn record_book_download(&self) -> Result<bool, CookieStoreError> {
        let count = self.books_since_save.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.token_save_interval {
            self.books_since_save.store(0, Ordering::SeqCst);
            self.cookies.save().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Persists the cookie jar unconditionally (shutdown flush).
    ///
    /// # Errors
    ///
    /// Returns the cookie-file write failure.
    pub async fn flush_cookies(&self) -> Result<(), CookieStoreError> {
        self.cookies.save().await
    }
}

fn content_type_is_html(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"))
}

fn header_string(value: Option<&HeaderValue>) -> Option<String> {
    value.and_then(|v| v.to_str().ok()).map(ToString::to_string)
}

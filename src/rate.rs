//! Request pacing and retry policy.
//!
//! The provider tolerates a slow, steady client. [`RatePolicy`] enforces a
//! minimum spacing per request class (`discovery`, `download`, and the
//! session-reuse gap at book boundaries); [`RetryPolicy`] governs how
//! transient failures are retried.
//!
//! The pipeline is serial, so there is no permit arbitration here: pacing
//! means sleeping between consecutive requests of the same class.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::error::FetchError;

/// Maximum `Retry-After` value honored (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Maximum jitter added to retry delays (500 ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Default maximum attempts per resource (initial try + 2 retries = 3).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base retry delay; attempt `n` waits `base * n`.
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(5);

/// The class of a request, for pacing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// Search API pagination during discovery.
    Discovery,
    /// A book boundary: one acquisition per book, before its first
    /// request.
    Download,
    /// The session-reuse gap between consecutive books on one session.
    SessionReuse,
    /// Intra-book requests (chapters, images, styles). Serial but
    /// unpaced; politeness comes from the book-boundary delays.
    Asset,
}

impl RequestClass {
    /// Stable label for log lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Download => "download",
            Self::SessionReuse => "session-reuse",
            Self::Asset => "asset",
        }
    }
}

/// State tracked per request class.
#[derive(Debug)]
struct ClassState {
    /// Time of the last request in this class. `None` means no request has
    /// been made yet, so the first one proceeds immediately.
    last_request: Mutex<Option<Instant>>,
}

impl ClassState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
        }
    }
}

/// Minimum-spacing enforcement per request class.
#[derive(Debug)]
pub struct RatePolicy {
    discovery_delay: Duration,
    download_delay: Duration,
    session_reuse_delay: Duration,
    classes: DashMap<RequestClass, Arc<ClassState>>,
}

impl RatePolicy {
    /// Creates a rate policy with explicit per-class spacings.
    #[must_use]
    pub fn new(
        discovery_delay: Duration,
        download_delay: Duration,
        session_reuse_delay: Duration,
    ) -> Self {
        Self {
            discovery_delay,
            download_delay,
            session_reuse_delay,
            classes: DashMap::new(),
        }
    }

    /// Creates a policy that applies no delays (tests, dry runs).
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Returns the configured spacing for a class.
    #[must_use]
    pub fn delay_for(&self, class: RequestClass) -> Duration {
        match class {
            RequestClass::Discovery => self.discovery_delay,
            RequestClass::Download => self.download_delay,
            RequestClass::SessionReuse => self.session_reuse_delay,
            RequestClass::Asset => Duration::ZERO,
        }
    }

    /// Waits until a request of the given class may proceed, then records
    /// the request time. The first request per class is immediate.
    #[instrument(level = "debug", skip(self), fields(class = class.label()))]
    pub async fn acquire(&self, class: RequestClass) {
        let min_delay = self.delay_for(class);
        if min_delay.is_zero() {
            return;
        }

        // Clone the Arc so the DashMap shard lock is released before any await.
        let state = self
            .classes
            .entry(class)
            .or_insert_with(|| Arc::new(ClassState::new()))
            .clone();

        let mut last_request = state.last_request.lock().await;
        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < min_delay {
                let wait = min_delay.saturating_sub(elapsed);
                debug!(class = class.label(), wait_ms = wait.as_millis() as u64, "pacing request");
                tokio::time::sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

/// Decision on whether a failed fetch should be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay; `attempt` is the upcoming attempt
    /// number (1-indexed).
    Retry { delay: Duration, attempt: u32 },
    /// Give up.
    DoNotRetry { reason: String },
}

/// Retry policy: linear backoff (`base × attempt`) with jitter, honoring
/// server-supplied `Retry-After` when present.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit settings. `max_attempts` counts the
    /// initial attempt and is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Default attempt count with zero delay, for tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::ZERO)
    }

    /// Returns the configured maximum attempts.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether the attempt that just failed should be retried.
    ///
    /// `attempt` is the 1-indexed attempt number that failed.
    #[instrument(level = "debug", skip(self, error), fields(kind = error.kind()))]
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> RetryDecision {
        if !is_retryable(error) {
            return RetryDecision::DoNotRetry {
                reason: format!("{} failure is not retryable", error.kind()),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "attempts exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self
            .server_mandated_delay(error)
            .unwrap_or_else(|| self.backoff_delay(attempt));

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Linear backoff: `base × attempt`, plus up to 500 ms jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(attempt);
        scaled + jitter()
    }

    /// A `Retry-After` header on a 429/503 overrides the computed backoff.
    fn server_mandated_delay(&self, error: &FetchError) -> Option<Duration> {
        if let FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } = error
        {
            return parse_retry_after(value);
        }
        None
    }
}

/// Whether an error class may succeed on retry.
///
/// Transport errors, timeouts, and 5xx (plus 429) are retryable; auth
/// failures, parse failures, other 4xx, and local IO errors are not.
#[must_use]
pub fn is_retryable(error: &FetchError) -> bool {
    match error {
        FetchError::Transport { .. } | FetchError::Timeout { .. } => true,
        FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        FetchError::AuthFailed { .. } | FetchError::Parse { .. } | FetchError::Io { .. } => false,
    }
}

fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    #[allow(clippy::cast_possible_truncation)]
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// Parses a `Retry-After` header value (integer seconds or HTTP-date),
/// capped at one hour. Returns `None` when unparseable or negative.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        // Date in the past: retry immediately.
        Err(_) => Some(Duration::ZERO),
    }
}

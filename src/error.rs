//! Error types shared across the acquisition pipeline.
//!
//! Errors are split by blast radius: [`FetchError`] covers a single HTTP
//! resource, [`BookError`] marks a whole book as failed, and [`JobError`]
//! aborts the entire run. Only authentication failures, resume conflicts,
//! and state-file write failures are job-fatal; everything else is recorded
//! and the controller moves on.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from fetching a single HTTP resource through the session.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The session is no longer authenticated: 401/403, or a JSON endpoint
    /// answered with HTML (the provider's login interstitial).
    #[error("authentication failed for {url}{}", fmt_status(.status))]
    AuthFailed {
        /// The URL that exposed the dead session.
        url: String,
        /// The HTTP status, when the failure came from a status code.
        status: Option<u16>,
    },

    /// Network-level error (DNS, connection refused or reset, TLS).
    #[error("network error requesting {url}: {source}")]
    Transport {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx/5xx) on a resource the caller needs.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The `Retry-After` header value, if the server sent one.
        retry_after: Option<String>,
    },

    /// Malformed JSON or unusable HTML on a critical resource.
    #[error("parse error on {url}: {message}")]
    Parse {
        /// The URL whose body could not be interpreted.
        url: String,
        /// What was wrong with it.
        message: String,
    },

    /// Local filesystem error while persisting a fetched resource.
    #[error("IO error writing {}: {source}", .path.display())]
    Io {
        /// The path that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map_or_else(String::new, |s| format!(" (HTTP {s})"))
}

impl FetchError {
    /// Creates an auth failure from a status code.
    pub fn auth_failed(url: impl Into<String>, status: Option<u16>) -> Self {
        Self::AuthFailed {
            url: url.into(),
            status,
        }
    }

    /// Creates a transport error from a reqwest error, mapping timeouts
    /// to the dedicated variant.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Transport { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short stable label for the failed-items map and log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailed { .. } => "auth",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::HttpStatus { .. } => "http",
            Self::Parse { .. } => "parse",
            Self::Io { .. } => "io",
        }
    }

    /// Whether this failure invalidates the whole session rather than the
    /// resource being fetched.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }
}

/// A failure that sank one book; the pipeline records it and continues.
#[derive(Debug, Error)]
#[error("book {book_id}: {source}")]
pub struct BookError {
    /// The opaque provider id of the failed book.
    pub book_id: String,
    /// The fetch failure that sank it.
    #[source]
    pub source: FetchError,
}

impl BookError {
    /// Wraps a fetch error with the book it belongs to.
    pub fn new(book_id: impl Into<String>, source: FetchError) -> Self {
        Self {
            book_id: book_id.into(),
            source,
        }
    }
}

/// Job-fatal errors. Anything here aborts the run with a non-zero exit.
#[derive(Debug, Error)]
pub enum JobError {
    /// Session authentication failed; the whole run is pointless without it.
    #[error(
        "authentication failed: {0}\n    Refresh the cookie file from a logged-in \
         browser session and rerun."
    )]
    Auth(#[from] FetchError),

    /// The progress file was written by a newer version of this tool.
    #[error(
        "progress file {} uses schema version {found} but this build supports \
         up to {supported}; upgrade the tool or remove the file to start fresh",
        .path.display()
    )]
    ResumeConflict {
        /// Path of the conflicting progress file.
        path: PathBuf,
        /// Schema version found on disk.
        found: u32,
        /// Highest schema version this build understands.
        supported: u32,
    },

    /// Configuration or input data is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A state file (progress or cookies) could not be written.
    #[error("failed to write state file {}: {source}", .path.display())]
    State {
        /// The state file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Process exit code for this error per the documented contract.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Auth(_) => 1,
            Self::ResumeConflict { .. } | Self::Config(_) => 2,
            Self::State { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failed_display_mentions_status() {
        let err = FetchError::auth_failed("https://example.com/api/v1/book/1/", Some(401));
        let msg = err.to_string();
        assert!(msg.contains("authentication failed"), "got: {msg}");
        assert!(msg.contains("HTTP 401"), "got: {msg}");
    }

    #[test]
    fn test_auth_failed_display_without_status() {
        let err = FetchError::auth_failed("https://example.com/api/v1/book/1/", None);
        assert!(!err.to_string().contains("HTTP"));
    }

    #[test]
    fn test_http_status_kind_and_display() {
        let err = FetchError::http_status("https://example.com/x", 503, None);
        assert_eq!(err.kind(), "http");
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_book_error_carries_id() {
        let err = BookError::new("9781492012345", FetchError::parse("u", "bad json"));
        let msg = err.to_string();
        assert!(msg.contains("9781492012345"), "got: {msg}");
        assert!(msg.contains("bad json"), "got: {msg}");
    }

    #[test]
    fn test_job_error_exit_codes() {
        let auth = JobError::Auth(FetchError::auth_failed("u", Some(403)));
        assert_eq!(auth.exit_code(), 1);

        let conflict = JobError::ResumeConflict {
            path: PathBuf::from("p.json"),
            found: 9,
            supported: 2,
        };
        assert_eq!(conflict.exit_code(), 2);

        let config = JobError::Config("bad delay".to_string());
        assert_eq!(config.exit_code(), 2);
    }

    #[test]
    fn test_transport_kind_labels_are_stable() {
        let parse = FetchError::parse("u", "m");
        assert_eq!(parse.kind(), "parse");
        let io = FetchError::io("/tmp/x", std::io::Error::other("boom"));
        assert_eq!(io.kind(), "io");
    }
}

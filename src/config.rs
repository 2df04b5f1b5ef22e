//! Job configuration: JSON-backed defaults for both discovery and download
//! runs.
//!
//! Every field has a default so an empty config file (or none at all) yields
//! a runnable configuration. CLI flags are merged on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::epub::Profile;

/// Which search API dialect discovery should speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Authenticated v1 search: `?q={topic}&rows=100&page={1..}`, ~15
    /// results per page, 1-indexed.
    #[serde(rename = "v1")]
    V1,
    /// Unauthenticated v2 search: `?query=*&topics={topic}&limit=100`,
    /// up to 100 results per page, 0-indexed, `total`/`next` signals.
    #[serde(rename = "v2")]
    V2,
}

/// Which EPUB build variant(s) a download run produces.
///
/// `legacy` and `enhanced` both build the standard profile (the historical
/// EPUB2/EPUB3 split collapsed once the packager emitted EPUB3 only);
/// `kindle` builds the reader-optimized profile; `dual` builds both from a
/// shared resource tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpubFormat {
    Legacy,
    Enhanced,
    Kindle,
    Dual,
}

impl EpubFormat {
    /// The profile variants this format requires on disk.
    #[must_use]
    pub fn profiles(self) -> &'static [Profile] {
        match self {
            Self::Legacy | Self::Enhanced => &[Profile::Standard],
            Self::Kindle => &[Profile::Kindle],
            Self::Dual => &[Profile::Standard, Profile::Kindle],
        }
    }
}

/// Configuration for a crawl-and-build job. All fields optional on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Provider origin for both the search and book APIs.
    pub base_url: String,
    /// Initial cookie jar (JSON object, cookie name → value).
    pub cookies_file: PathBuf,
    /// Output root for downloaded books, one subfolder per topic.
    pub base_directory: PathBuf,
    /// Output root for per-topic manifest files.
    pub book_ids_directory: PathBuf,
    /// Topic catalogue input file.
    pub skills_file: PathBuf,
    /// Search dialect to use during discovery.
    pub discovery_api_version: ApiVersion,
    /// Per-topic cap on accepted books (`None` = unlimited).
    pub max_books_per_skill: Option<usize>,
    /// Hard cap on search pages per topic.
    pub max_pages_per_skill: u32,
    /// Minimum seconds between discovery requests.
    pub discovery_delay: f64,
    /// Minimum seconds between book downloads.
    pub download_delay: f64,
    /// Minimum seconds between session-impacting requests at book
    /// boundaries.
    pub session_reuse_delay: f64,
    /// EPUB build variant(s) to produce.
    pub epub_format: EpubFormat,
    /// Honor an existing progress file.
    pub resume: bool,
    /// Ignore the on-disk existence check and re-download everything.
    pub force_redownload: bool,
    /// Persist the cookie jar every N successful book downloads.
    pub token_save_interval: u32,
    /// Progress checkpoint file path.
    pub progress_file: PathBuf,
    /// Requested pipeline concurrency. Anything above 1 is clamped: the
    /// provider rotates the auth token on every response, so concurrent
    /// in-flight requests on one session race on the cookie jar.
    pub max_workers: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            base_url: "https://learning.oreilly.com".to_string(),
            cookies_file: PathBuf::from("cookies.json"),
            base_directory: PathBuf::from("books_by_skills"),
            book_ids_directory: PathBuf::from("book_ids"),
            skills_file: PathBuf::from("favorite_skills_with_counts.json"),
            discovery_api_version: ApiVersion::V2,
            max_books_per_skill: None,
            max_pages_per_skill: 100,
            discovery_delay: 1.5,
            download_delay: 10.0,
            session_reuse_delay: 2.0,
            epub_format: EpubFormat::Dual,
            resume: true,
            force_redownload: false,
            token_save_interval: 5,
            progress_file: PathBuf::from("output/download_progress.json"),
            max_workers: 1,
        }
    }
}

impl JobConfig {
    /// Loads configuration from a JSON file, falling back to defaults when
    /// no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or when the
    /// resulting configuration fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file '{}'", path.display()))?;
                serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("failed to parse config file '{}'", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("invalid config value for `base_url`: must not be empty");
        }
        if url::Url::parse(&self.base_url).is_err() {
            bail!("invalid config value for `base_url`: {}", self.base_url);
        }
        if !(1..=1000).contains(&self.max_pages_per_skill) {
            bail!(
                "invalid config value for `max_pages_per_skill`: {}. Expected range: 1..=1000",
                self.max_pages_per_skill
            );
        }
        for (name, value) in [
            ("discovery_delay", self.discovery_delay),
            ("download_delay", self.download_delay),
            ("session_reuse_delay", self.session_reuse_delay),
        ] {
            if !value.is_finite() || value < 0.0 || value > 3600.0 {
                bail!("invalid config value for `{name}`: {value}. Expected range: 0..=3600");
            }
        }
        if self.token_save_interval == 0 {
            bail!("invalid config value for `token_save_interval`: 0. Expected at least 1");
        }
        if self.max_workers == 0 {
            bail!("invalid config value for `max_workers`: 0. Expected at least 1");
        }
        Ok(())
    }

    /// Effective pipeline concurrency. Always 1; a higher request is
    /// refused with a warning because the sliding-token scheme cannot
    /// survive concurrent in-flight requests on one session.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.max_workers > 1 {
            warn!(
                requested = self.max_workers,
                "concurrency > 1 is incompatible with in-band token rotation; forcing serial \
                 pipeline"
            );
        }
        1
    }

    /// Minimum spacing between discovery requests.
    #[must_use]
    pub fn discovery_delay(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_delay)
    }

    /// Minimum spacing between book downloads.
    #[must_use]
    pub fn download_delay(&self) -> Duration {
        Duration::from_secs_f64(self.download_delay)
    }

    /// Minimum spacing between session-impacting requests.
    #[must_use]
    pub fn session_reuse_delay(&self) -> Duration {
        Duration::from_secs_f64(self.session_reuse_delay)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.base_directory, PathBuf::from("books_by_skills"));
        assert_eq!(config.book_ids_directory, PathBuf::from("book_ids"));
        assert_eq!(config.discovery_api_version, ApiVersion::V2);
        assert_eq!(config.max_books_per_skill, None);
        assert_eq!(config.max_pages_per_skill, 100);
        assert!((config.discovery_delay - 1.5).abs() < f64::EPSILON);
        assert!((config.download_delay - 10.0).abs() < f64::EPSILON);
        assert!((config.session_reuse_delay - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.epub_format, EpubFormat::Dual);
        assert!(config.resume);
        assert!(!config.force_redownload);
        assert_eq!(config.token_save_interval, 5);
    }

    #[test]
    fn test_partial_config_file_fills_defaults() {
        let parsed: JobConfig =
            serde_json::from_str(r#"{"download_delay": 0.5, "epub_format": "kindle"}"#).unwrap();
        assert!((parsed.download_delay - 0.5).abs() < f64::EPSILON);
        assert_eq!(parsed.epub_format, EpubFormat::Kindle);
        assert_eq!(parsed.max_pages_per_skill, 100);
        assert!(parsed.resume);
    }

    #[test]
    fn test_validate_rejects_bad_delay() {
        let config = JobConfig {
            discovery_delay: -1.0,
            ..JobConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("discovery_delay"), "got: {err}");
    }

    #[test]
    fn test_validate_rejects_zero_pages() {
        let config = JobConfig {
            max_pages_per_skill: 0,
            ..JobConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_concurrency_is_always_serial() {
        let config = JobConfig {
            max_workers: 8,
            ..JobConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_epub_format_profiles() {
        assert_eq!(EpubFormat::Legacy.profiles(), &[Profile::Standard]);
        assert_eq!(EpubFormat::Enhanced.profiles(), &[Profile::Standard]);
        assert_eq!(EpubFormat::Kindle.profiles(), &[Profile::Kindle]);
        assert_eq!(
            EpubFormat::Dual.profiles(),
            &[Profile::Standard, Profile::Kindle]
        );
    }

    #[test]
    fn test_api_version_serde_labels() {
        assert_eq!(serde_json::to_string(&ApiVersion::V2).unwrap(), "\"v2\"");
        let v1: ApiVersion = serde_json::from_str("\"v1\"").unwrap();
        assert_eq!(v1, ApiVersion::V1);
    }
}

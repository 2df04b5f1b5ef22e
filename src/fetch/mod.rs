//! Book acquisition: metadata, chapter manifest, chapter bodies, and the
//! assets they reference.
//!
//! Failure semantics: metadata, manifest, and chapter failures are fatal to
//! the book (the controller records them and moves on). Image failures are
//! retried independently and never sink the book; a stylesheet that cannot
//! be fetched is simply left out of the package manifest.

pub mod assets;
pub mod html;

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use assets::{AssetDownloader, AssetEntry, AssetReport};

use crate::error::FetchError;
use crate::rate::{RatePolicy, RequestClass, RetryPolicy};
use crate::session::SessionClient;

/// Upgraded cover variants must be at least this large to be trusted.
const MIN_COVER_BYTES: usize = 10 * 1024;

/// Numeric id inside a book-info URL (`.../book/{digits}/`).
static BOOK_URL_ID: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"/book/(\d+)/").unwrap()
});

/// Extracts the opaque book id from either a bare id or a book-info URL.
#[must_use]
pub fn extract_book_id(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.starts_with("http") {
        return raw.to_string();
    }
    if let Some(caps) = BOOK_URL_ID.captures(raw) {
        return caps[1].to_string();
    }
    raw.split('/')
        .filter(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()))
        .next_back()
        .unwrap_or(raw)
        .to_string()
}

/// Book metadata, persisted as a `metadata.json` sidecar in the book
/// folder. Carries the raw API payload for anything this view drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMetadata {
    pub book_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub publisher: String,
    pub isbn: String,
    pub description: String,
    pub subjects: Vec<String>,
    pub rights: String,
    pub release_date: String,
    pub web_url: String,
    pub cover_url: String,
    pub raw_api_data: serde_json::Value,
}

impl BookMetadata {
    /// Builds metadata from the book-info API payload, with provider-shaped
    /// fallbacks for missing fields.
    #[must_use]
    pub fn from_api(book_id: &str, base_url: &str, raw: serde_json::Value) -> Self {
        let get_str = |key: &str| -> Option<String> {
            raw.get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };

        let title = get_str("title").unwrap_or_else(|| format!("Book {book_id}"));
        let authors = name_list(raw.get("authors"));
        let publisher = {
            let publishers = name_list(raw.get("publishers"));
            if publishers.is_empty() {
                get_str("publisher").unwrap_or_else(|| "Unknown Publisher".to_string())
            } else {
                publishers.join(", ")
            }
        };

        Self {
            book_id: book_id.to_string(),
            title,
            authors,
            publisher,
            isbn: get_str("isbn")
                .or_else(|| get_str("identifier"))
                .unwrap_or_else(|| book_id.to_string()),
            description: get_str("description").unwrap_or_default(),
            subjects: name_list(raw.get("subjects")),
            rights: get_str("rights").unwrap_or_default(),
            release_date: get_str("issued")
                .or_else(|| get_str("release_date"))
                .unwrap_or_default(),
            web_url: get_str("web_url")
                .unwrap_or_else(|| format!("{base_url}/library/view/book/{book_id}/")),
            cover_url: get_str("cover_url")
                .or_else(|| get_str("cover"))
                .unwrap_or_else(|| format!("{base_url}/library/cover/{book_id}/")),
            raw_api_data: raw,
        }
    }

    /// First author, or a placeholder when the provider listed none.
    #[must_use]
    pub fn first_author(&self) -> &str {
        self.authors
            .first()
            .map_or("Unknown Author", String::as_str)
    }
}

/// Flattens a provider list of strings or `{name}` objects.
fn name_list(value: Option<&serde_json::Value>) -> Vec<String> {
    let Some(serde_json::Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(name) => Some(name.clone()),
            serde_json::Value::Object(object) => object
                .get("name")
                .and_then(serde_json::Value::as_str)
                .map(ToString::to_string),
            _ => None,
        })
        .filter(|name| !name.trim().is_empty())
        .collect()
}

/// One chapter descriptor from the provider's chapter manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ChapterDescriptor {
    filename: String,
    title: String,
    /// Chapter body URL.
    content: String,
    /// Base URL the chapter's relative asset refs resolve against.
    asset_base_url: String,
    images: Vec<String>,
    stylesheets: Vec<StylesheetRef>,
    site_styles: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StylesheetRef {
    url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ChapterManifestPage {
    results: Vec<ChapterDescriptor>,
    next: Option<String>,
}

/// One processed chapter, in provider manifest order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterNode {
    /// Package filename (`.xhtml`).
    pub filename: String,
    /// Chapter title from the manifest.
    pub title: String,
    /// The chapter body URL it came from.
    pub http_url: String,
    /// Asset resolution base.
    pub asset_base_url: String,
    /// In-file anchor for navigation; empty when the chapter has no
    /// heading.
    pub fragment: String,
    /// Local stylesheet names this chapter links.
    pub stylesheet_refs: Vec<String>,
    /// Absolute image URLs this chapter references.
    pub image_refs: Vec<String>,
}

/// Everything fetched for one book, ready for packaging.
#[derive(Debug)]
pub struct FetchedBook {
    pub metadata: BookMetadata,
    /// Chapters in the provider's authoritative order.
    pub chapters: Vec<ChapterNode>,
    /// Image URLs that failed permanently (book still builds).
    pub missing_images: Vec<String>,
    /// Cover image filename under `Images/`, when the cover downloaded.
    pub cover_file: Option<String>,
}

/// Fetches one book's content tree through the authenticated session.
#[derive(Debug)]
pub struct BookFetcher {
    session: Arc<SessionClient>,
    rate: Arc<RatePolicy>,
    retry: RetryPolicy,
    base_url: String,
}

impl BookFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub fn new(
        session: Arc<SessionClient>,
        rate: Arc<RatePolicy>,
        retry: RetryPolicy,
        base_url: &str,
    ) -> Self {
        Self {
            session,
            rate,
            retry,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Book-info API URL for an id.
    #[must_use]
    pub fn book_info_url(&self, book_id: &str) -> String {
        format!("{}/api/v1/book/{book_id}/", self.base_url)
    }

    /// Downloads and processes a whole book into `book_dir`.
    ///
    /// Creates the `OEBPS/` tree, writes chapter XHTML, downloaded
    /// stylesheets, images, the cover, and the metadata sidecar.
    ///
    /// # Errors
    ///
    /// Metadata, chapter-manifest, or chapter failures are fatal to the
    /// book and returned here.
    #[instrument(skip(self), fields(book_id = %book_id))]
    pub async fn fetch_book(
        &self,
        book_id: &str,
        book_dir: &Path,
    ) -> Result<FetchedBook, FetchError> {
        let info_url = self.book_info_url(book_id);
        let raw: serde_json::Value = self
            .session
            .get_json_retrying(&info_url, &self.rate, RequestClass::Asset, &self.retry)
            .await?;
        let metadata = BookMetadata::from_api(book_id, &self.base_url, raw);

        info!(
            title = %metadata.title,
            "download: fetching book"
        );

        let oebps = book_dir.join("OEBPS");
        let images_dir = oebps.join("Images");
        let styles_dir = oebps.join("Styles");
        for dir in [&oebps, &images_dir, &styles_dir] {
            std::fs::create_dir_all(dir).map_err(|e| FetchError::io(dir.as_path(), e))?;
        }

        self.write_metadata_sidecar(&metadata, book_dir)?;

        let descriptors = self.fetch_chapter_manifest(&info_url, &metadata).await?;
        if descriptors.is_empty() {
            return Err(FetchError::parse(&info_url, "chapter manifest is empty"));
        }

        // Book-level ordered stylesheet registry: Style00.css, Style01.css…
        let mut stylesheet_urls: Vec<String> = Vec::new();
        let mut image_entries: Vec<AssetEntry> = Vec::new();
        let mut chapters: Vec<ChapterNode> = Vec::new();

        for (index, descriptor) in descriptors.iter().enumerate() {
            let chapter = self
                .process_chapter(
                    book_id,
                    index,
                    descriptor,
                    &oebps,
                    &mut stylesheet_urls,
                    &mut image_entries,
                )
                .await?;
            chapters.push(chapter);
        }

        // Stylesheets next: their url() refs can add images to the batch.
        self.download_stylesheets(&stylesheet_urls, &styles_dir, &mut image_entries)
            .await;

        let downloader = AssetDownloader::new(
            Arc::clone(&self.session),
            Arc::clone(&self.rate),
            self.retry.clone(),
        );
        let report = downloader.download_images(&image_entries, &images_dir).await;
        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                "download: some images missing; packaging anyway"
            );
        }

        let cover_file = self.download_cover(&metadata, &images_dir).await;

        Ok(FetchedBook {
            metadata,
            chapters,
            missing_images: report.failed,
            cover_file,
        })
    }

    fn write_metadata_sidecar(
        &self,
        metadata: &BookMetadata,
        book_dir: &Path,
    ) -> Result<(), FetchError> {
        let path = book_dir.join("metadata.json");
        let body = serde_json::to_vec_pretty(metadata)
            .map_err(|e| FetchError::parse(path.display().to_string(), e.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &body).map_err(|e| FetchError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| FetchError::io(&path, e))?;
        Ok(())
    }

    /// Walks the paginated chapter manifest; response order is
    /// authoritative.
    async fn fetch_chapter_manifest(
        &self,
        info_url: &str,
        metadata: &BookMetadata,
    ) -> Result<Vec<ChapterDescriptor>, FetchError> {
        let first_url = metadata
            .raw_api_data
            .get("chapter_list")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| format!("{info_url}chapter/"), ToString::to_string);

        let mut descriptors = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!("{first_url}?page={page}");
            let manifest: ChapterManifestPage = self
                .session
                .get_json_retrying(&url, &self.rate, RequestClass::Asset, &self.retry)
                .await?;
            let had_next = manifest.next.is_some();
            descriptors.extend(manifest.results);
            if !had_next {
                break;
            }
            page += 1;
        }

        debug!(chapters = descriptors.len(), "download: chapter manifest complete");
        Ok(descriptors)
    }

    /// Fetches and processes one chapter body into its package XHTML file.
    #[allow(clippy::too_many_arguments)]
    async fn process_chapter(
        &self,
        book_id: &str,
        index: usize,
        descriptor: &ChapterDescriptor,
        oebps: &Path,
        stylesheet_urls: &mut Vec<String>,
        image_entries: &mut Vec<AssetEntry>,
    ) -> Result<ChapterNode, FetchError> {
        let body_html = self
            .session
            .get_text_retrying(
                &descriptor.content,
                &self.rate,
                RequestClass::Asset,
                &self.retry,
            )
            .await?;

        let asset_base = self.asset_base_for(book_id, descriptor);
        let refs = html::collect_refs(&body_html);

        // Declared stylesheets first, then ones found in the markup.
        let mut chapter_styles: Vec<String> = Vec::new();
        let declared = descriptor
            .stylesheets
            .iter()
            .map(|sheet| sheet.url.clone())
            .chain(descriptor.site_styles.iter().cloned())
            .chain(
                refs.stylesheet_hrefs
                    .iter()
                    .filter_map(|href| resolve_url(&asset_base, href)),
            );
        for url in declared {
            if url.is_empty() {
                continue;
            }
            let position = match stylesheet_urls.iter().position(|u| u == &url) {
                Some(position) => position,
                None => {
                    stylesheet_urls.push(url.clone());
                    stylesheet_urls.len() - 1
                }
            };
            let local = stylesheet_local_name(position);
            if !chapter_styles.contains(&local) {
                chapter_styles.push(local);
            }
        }

        // Image refs: manifest-declared plus markup-discovered.
        let mut image_refs: Vec<String> = Vec::new();
        for raw_ref in descriptor.images.iter().chain(refs.image_srcs.iter()) {
            let Some(absolute) = resolve_url(&asset_base, raw_ref) else {
                continue;
            };
            if image_refs.contains(&absolute) {
                continue;
            }
            image_refs.push(absolute.clone());
            let local_name = html::local_image_name(&absolute);
            if !image_entries.iter().any(|e| e.local_name == local_name) {
                image_entries.push(AssetEntry {
                    url: absolute,
                    local_name,
                });
            }
        }

        let body = html::extract_body(&body_html);
        let body = html::rewrite_body(&body, book_id);
        let (body, fragment) = html::ensure_heading_fragment(&body, &descriptor.title);
        let xhtml =
            html::to_xhtml_document(&descriptor.title, &chapter_styles, &refs.inline_styles, &body);

        let filename = chapter_filename(descriptor, index);
        let path = oebps.join(&filename);
        std::fs::write(&path, xhtml.as_bytes()).map_err(|e| FetchError::io(&path, e))?;
        debug!(filename = %filename, fragment = %fragment, "download: chapter saved");

        Ok(ChapterNode {
            filename,
            title: descriptor.title.clone(),
            http_url: descriptor.content.clone(),
            asset_base_url: asset_base,
            fragment,
            stylesheet_refs: chapter_styles,
            image_refs,
        })
    }

    /// The base URL chapter assets resolve against. Chapters served from
    /// the v2 content endpoint use the v2 files tree regardless of what
    /// the manifest claims.
    fn asset_base_for(&self, book_id: &str, descriptor: &ChapterDescriptor) -> String {
        if descriptor.content.contains("/v2/") {
            return format!(
                "{}/api/v2/epubs/urn:orm:book:{book_id}/files/",
                self.base_url
            );
        }
        ensure_dir_url(&descriptor.asset_base_url)
    }

    /// Downloads every registered stylesheet, rewriting CSS image refs and
    /// queueing the images they point at. Failed sheets are omitted.
    async fn download_stylesheets(
        &self,
        stylesheet_urls: &[String],
        styles_dir: &Path,
        image_entries: &mut Vec<AssetEntry>,
    ) {
        let downloader = AssetDownloader::new(
            Arc::clone(&self.session),
            Arc::clone(&self.rate),
            self.retry.clone(),
        );

        for (index, url) in stylesheet_urls.iter().enumerate() {
            let local = stylesheet_local_name(index);
            let target = styles_dir.join(&local);
            if target.is_file() {
                debug!(name = %local, "skip: stylesheet already on disk");
                continue;
            }

            match downloader.fetch_stylesheet(url).await {
                Ok(css) => {
                    let (rewritten, css_images) = html::rewrite_css_urls(&css);
                    for image in css_images {
                        if let Some(absolute) = resolve_url(url, &image) {
                            let local_name = html::local_image_name(&absolute);
                            if !image_entries.iter().any(|e| e.local_name == local_name) {
                                image_entries.push(AssetEntry {
                                    url: absolute,
                                    local_name,
                                });
                            }
                        }
                    }
                    if let Err(e) = std::fs::write(&target, rewritten.as_bytes()) {
                        warn!(name = %local, error = %e, "fail: could not write stylesheet");
                    }
                }
                Err(error) => {
                    warn!(
                        url = %url,
                        error = %error,
                        "fail: stylesheet abandoned; omitting from package"
                    );
                }
            }
        }
    }

    /// Downloads the cover, preferring larger variants of thumbnail URLs.
    /// Non-fatal: a missing cover produces a book without one.
    async fn download_cover(&self, metadata: &BookMetadata, images_dir: &Path) -> Option<String> {
        if metadata.cover_url.is_empty() {
            return None;
        }

        let filename = format!(
            "cover_{}.{}",
            metadata.book_id,
            cover_extension(&metadata.cover_url)
        );
        let target = images_dir.join(&filename);
        if target.is_file() {
            return Some(filename);
        }

        // Upgraded variants must prove themselves with a real payload.
        for variant in cover_variants(&metadata.cover_url) {
            self.rate.acquire(RequestClass::Asset).await;
            match self.session.get_bytes(&variant).await {
                Ok(bytes) if bytes.len() >= MIN_COVER_BYTES => {
                    if std::fs::write(&target, &bytes).is_ok() {
                        debug!(variant = %variant, bytes = bytes.len(), "download: cover variant used");
                        return Some(filename);
                    }
                }
                Ok(bytes) => {
                    debug!(variant = %variant, bytes = bytes.len(), "cover variant too small");
                }
                Err(error) => {
                    debug!(variant = %variant, error = %error, "cover variant failed");
                }
            }
        }

        // Fall back to the original URL, whatever its size.
        let mut attempt = 1u32;
        loop {
            self.rate.acquire(RequestClass::Asset).await;
            match self.session.get_bytes(&metadata.cover_url).await {
                Ok(bytes) if !bytes.is_empty() => {
                    return std::fs::write(&target, &bytes).ok().map(|()| filename);
                }
                Ok(_) => return None,
                Err(error) => match self.retry.should_retry(&error, attempt) {
                    crate::rate::RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        warn!(error = %error, "retry: cover fetch failed");
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    crate::rate::RetryDecision::DoNotRetry { .. } => {
                        warn!(error = %error, "fail: cover unavailable; packaging without it");
                        return None;
                    }
                },
            }
        }
    }
}

/// `Style00.css`, `Style01.css`, … by registry position.
#[must_use]
pub fn stylesheet_local_name(index: usize) -> String {
    format!("Style{index:02}.css")
}

/// Chapter package filename: the manifest filename with `.html` swapped
/// for `.xhtml`, or a positional name when the manifest omits one.
fn chapter_filename(descriptor: &ChapterDescriptor, index: usize) -> String {
    let name = descriptor.filename.trim();
    if name.is_empty() {
        return format!("chapter{:03}.xhtml", index + 1);
    }
    let name = name.rsplit('/').next().unwrap_or(name);
    if name.ends_with(".xhtml") {
        name.to_string()
    } else if let Some(stem) = name.strip_suffix(".html") {
        format!("{stem}.xhtml")
    } else {
        format!("{name}.xhtml")
    }
}

/// Resolves a possibly-relative reference against a base URL, with
/// standard relative-URL semantics (a base ending in a filename has that
/// filename replaced; directory bases must end with `/`).
fn resolve_url(base: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if reference.contains("://") {
        return Some(reference.to_string());
    }
    if let Some(rest) = reference.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }

    Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(String::from)
        .ok()
}

/// Ensures a directory-style base URL ends with `/` so joins nest under
/// it instead of replacing its last segment.
fn ensure_dir_url(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

/// Larger-image variants to probe before settling for a thumbnail URL.
fn cover_variants(url: &str) -> Vec<String> {
    let mut variants = Vec::new();

    if let Ok(parsed) = Url::parse(url) {
        let small_width = parsed
            .query_pairs()
            .find(|(key, _)| key == "w")
            .and_then(|(_, value)| value.parse::<u32>().ok())
            .filter(|width| *width < 800);
        if small_width.is_some() {
            let mut upgraded = parsed.clone();
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(key, value)| {
                    if key == "w" {
                        (key.into_owned(), "800".to_string())
                    } else {
                        (key.into_owned(), value.into_owned())
                    }
                })
                .collect();
            upgraded
                .query_pairs_mut()
                .clear()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            variants.push(upgraded.to_string());
        }
    }

    if url.contains("/small/") {
        variants.push(url.replace("/small/", "/large/"));
    }

    variants
}

/// Image extension guessed from the cover URL path.
fn cover_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    if path.ends_with(".png") {
        "png"
    } else if path.ends_with(".gif") {
        "gif"
    } else {
        "jpg"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== extract_book_id ====================

    #[test]
    fn test_extract_book_id_from_plain_id() {
        assert_eq!(extract_book_id("9781492052586"), "9781492052586");
    }

    #[test]
    fn test_extract_book_id_from_info_url() {
        assert_eq!(
            extract_book_id("https://www.example.com/api/v1/book/9781492052586/"),
            "9781492052586"
        );
    }

    #[test]
    fn test_extract_book_id_from_url_without_book_segment() {
        assert_eq!(
            extract_book_id("https://www.example.com/library/9781492052586/view"),
            "9781492052586"
        );
    }

    // ==================== BookMetadata ====================

    #[test]
    fn test_metadata_from_api_full_payload() {
        let raw = serde_json::json!({
            "title": "Fluent Python",
            "authors": [{"name": "Luciano Ramalho"}],
            "publishers": [{"name": "O'Reilly Media, Inc."}],
            "isbn": "9781492056355",
            "description": "Less code, more clarity.",
            "subjects": [{"name": "Python"}],
            "rights": "All rights reserved.",
            "issued": "2022-03-31",
            "web_url": "https://example.com/library/view/x/9781492056355/",
            "cover_url": "https://example.com/covers/9781492056355.jpg"
        });
        let metadata = BookMetadata::from_api("9781492056355", "https://example.com", raw);
        assert_eq!(metadata.title, "Fluent Python");
        assert_eq!(metadata.first_author(), "Luciano Ramalho");
        assert_eq!(metadata.publisher, "O'Reilly Media, Inc.");
        assert_eq!(metadata.release_date, "2022-03-31");
        assert_eq!(metadata.subjects, vec!["Python"]);
    }

    #[test]
    fn test_metadata_from_api_defaults() {
        let metadata =
            BookMetadata::from_api("123", "https://example.com", serde_json::json!({}));
        assert_eq!(metadata.title, "Book 123");
        assert_eq!(metadata.first_author(), "Unknown Author");
        assert_eq!(metadata.isbn, "123");
        assert_eq!(
            metadata.cover_url,
            "https://example.com/library/cover/123/"
        );
        assert_eq!(metadata.publisher, "Unknown Publisher");
    }

    #[test]
    fn test_metadata_authors_accept_plain_strings() {
        let raw = serde_json::json!({"authors": ["Ada Lovelace", "Charles Babbage"]});
        let metadata = BookMetadata::from_api("1", "https://example.com", raw);
        assert_eq!(metadata.authors, vec!["Ada Lovelace", "Charles Babbage"]);
    }

    // ==================== chapter filenames ====================

    #[test]
    fn test_chapter_filename_swaps_extension() {
        let descriptor = ChapterDescriptor {
            filename: "ch01.html".to_string(),
            ..ChapterDescriptor::default()
        };
        assert_eq!(chapter_filename(&descriptor, 0), "ch01.xhtml");
    }

    #[test]
    fn test_chapter_filename_strips_directories() {
        let descriptor = ChapterDescriptor {
            filename: "OEBPS/text/ch02.html".to_string(),
            ..ChapterDescriptor::default()
        };
        assert_eq!(chapter_filename(&descriptor, 1), "ch02.xhtml");
    }

    #[test]
    fn test_chapter_filename_positional_fallback() {
        let descriptor = ChapterDescriptor::default();
        assert_eq!(chapter_filename(&descriptor, 6), "chapter007.xhtml");
    }

    // ==================== URL resolution ====================

    #[test]
    fn test_resolve_url_relative_against_directory_base() {
        assert_eq!(
            resolve_url(&ensure_dir_url("https://h/files"), "images/f1.png").as_deref(),
            Some("https://h/files/images/f1.png")
        );
    }

    #[test]
    fn test_resolve_url_file_base_replaces_filename() {
        // A CSS file's relative url() refs resolve next to the CSS file.
        assert_eq!(
            resolve_url("https://h/files/style.css", "images/bg.png").as_deref(),
            Some("https://h/files/images/bg.png")
        );
    }

    #[test]
    fn test_resolve_url_absolute_passthrough() {
        assert_eq!(
            resolve_url("https://h/files/", "https://cdn/x.css").as_deref(),
            Some("https://cdn/x.css")
        );
    }

    #[test]
    fn test_resolve_url_protocol_relative() {
        assert_eq!(
            resolve_url("https://h/", "//cdn.example.com/a.css").as_deref(),
            Some("https://cdn.example.com/a.css")
        );
    }

    #[test]
    fn test_resolve_url_empty_is_none() {
        assert_eq!(resolve_url("https://h/", "  "), None);
    }

    // ==================== cover variants ====================

    #[test]
    fn test_cover_variants_upgrades_small_width() {
        let variants = cover_variants("https://h/covers/1.jpg?w=200");
        assert_eq!(variants, vec!["https://h/covers/1.jpg?w=800"]);
    }

    #[test]
    fn test_cover_variants_large_width_untouched() {
        assert!(cover_variants("https://h/covers/1.jpg?w=1200").is_empty());
    }

    #[test]
    fn test_cover_variants_small_path_segment() {
        let variants = cover_variants("https://h/covers/small/1.jpg");
        assert_eq!(variants, vec!["https://h/covers/large/1.jpg"]);
    }

    #[test]
    fn test_cover_variants_combined() {
        let variants = cover_variants("https://h/small/1.jpg?w=200");
        assert_eq!(variants.len(), 2);
        assert!(variants[0].contains("w=800"));
        assert!(variants[1].contains("/large/"));
    }

    #[test]
    fn test_cover_extension_guessing() {
        assert_eq!(cover_extension("https://h/c.png?w=200"), "png");
        assert_eq!(cover_extension("https://h/c.jpeg"), "jpg");
        assert_eq!(cover_extension("https://h/cover/123/"), "jpg");
    }

    #[test]
    fn test_stylesheet_local_name_is_zero_padded() {
        assert_eq!(stylesheet_local_name(0), "Style00.css");
        assert_eq!(stylesheet_local_name(11), "Style11.css");
    }
}

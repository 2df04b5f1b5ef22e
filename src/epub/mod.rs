//! E-book packaging: the ZIP container, package document, navigation, and
//! the two build profiles.
//!
//! Layout inside the container:
//!
//! ```text
//! mimetype                  (stored, first entry)
//! META-INF/container.xml
//! OEBPS/content.opf
//! OEBPS/nav.xhtml
//! OEBPS/toc.ncx
//! OEBPS/cover.xhtml
//! OEBPS/<chapters>.xhtml
//! OEBPS/Images/…
//! OEBPS/Styles/…
//! ```
//!
//! In `dual` mode both profile variants are produced from the same on-disk
//! `OEBPS/` tree; only the package document and the bundled profile
//! stylesheet differ between the two files.

mod css;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use zip::write::SimpleFileOptions;

pub use css::{KINDLE_CSS, STANDARD_CSS};

use crate::config::EpubFormat;
use crate::fetch::html::xml_escape;
use crate::fetch::{BookMetadata, ChapterNode};
use crate::naming::epub_file_name;

/// A build profile of the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Generic EPUB profile.
    Standard,
    /// Reader-optimized profile (page-break control, justified text).
    Kindle,
}

impl Profile {
    /// The bundled stylesheet name for this profile.
    #[must_use]
    pub fn css_filename(self) -> &'static str {
        match self {
            Self::Standard => "standard-style.css",
            Self::Kindle => "kindle-style.css",
        }
    }

    /// The bundled stylesheet rules for this profile.
    #[must_use]
    pub fn css_content(self) -> &'static str {
        match self {
            Self::Standard => STANDARD_CSS,
            Self::Kindle => KINDLE_CSS,
        }
    }

    /// Stable label for log lines.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Kindle => "kindle",
        }
    }
}

/// Packaging failures.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Filesystem failure while assembling the package.
    #[error("IO error packaging {}: {source}", .path.display())]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// ZIP container failure.
    #[error("zip error packaging {}: {source}", .path.display())]
    Zip {
        /// The package path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: zip::result::ZipError,
    },

    /// The built package failed its structural check.
    #[error("package {} failed structural check: {}", .path.display(), .problems.join("; "))]
    Structure {
        /// The package path.
        path: PathBuf,
        /// Everything the check found wrong.
        problems: Vec<String>,
    },
}

impl PackageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(path: &Path, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Builds the e-book package(s) for one fetched book.
#[derive(Debug)]
pub struct EpubBuilder<'a> {
    book_dir: &'a Path,
    metadata: &'a BookMetadata,
    chapters: &'a [ChapterNode],
    cover_file: Option<&'a str>,
}

impl<'a> EpubBuilder<'a> {
    /// Creates a builder over a fetched book tree.
    #[must_use]
    pub fn new(
        book_dir: &'a Path,
        metadata: &'a BookMetadata,
        chapters: &'a [ChapterNode],
        cover_file: Option<&'a str>,
    ) -> Self {
        Self {
            book_dir,
            metadata,
            chapters,
            cover_file,
        }
    }

    /// Builds every profile the configured format requires. Returns the
    /// package paths in profile order.
    ///
    /// # Errors
    ///
    /// Returns the first packaging or structural-check failure.
    pub fn build_all(&self, format: EpubFormat) -> Result<Vec<PathBuf>, PackageError> {
        format
            .profiles()
            .iter()
            .map(|profile| self.build(*profile))
            .collect()
    }

    /// Builds one profile variant and verifies it structurally.
    ///
    /// # Errors
    ///
    /// Returns IO/ZIP errors or [`PackageError::Structure`] when the
    /// post-build check fails.
    #[instrument(skip(self), fields(profile = profile.label(), book = %self.metadata.book_id))]
    pub fn build(&self, profile: Profile) -> Result<PathBuf, PackageError> {
        self.write_shared_documents()?;

        let epub_name = epub_file_name(&self.metadata.title, self.metadata.first_author(), profile);
        let epub_path = self.book_dir.join(epub_name);
        self.zip_package(&epub_path, profile)?;
        verify_package(&epub_path, self.chapters)?;

        info!(path = %epub_path.display(), "save: package built");
        Ok(epub_path)
    }

    /// Writes the profile-independent documents into the shared `OEBPS/`
    /// tree: navigation, NCX, and the cover page.
    fn write_shared_documents(&self) -> Result<(), PackageError> {
        let oebps = self.book_dir.join("OEBPS");
        std::fs::create_dir_all(&oebps).map_err(|e| PackageError::io(&oebps, e))?;

        let nav_path = oebps.join("nav.xhtml");
        std::fs::write(&nav_path, self.render_nav_xhtml())
            .map_err(|e| PackageError::io(&nav_path, e))?;

        let ncx_path = oebps.join("toc.ncx");
        std::fs::write(&ncx_path, self.render_toc_ncx())
            .map_err(|e| PackageError::io(&ncx_path, e))?;

        if let Some(cover) = self.cover_file {
            let cover_path = oebps.join("cover.xhtml");
            std::fs::write(&cover_path, render_cover_xhtml(cover))
                .map_err(|e| PackageError::io(&cover_path, e))?;
        }

        Ok(())
    }

    /// Navigation document: one link per chapter, `file#fragment` when the
    /// chapter has a fragment, bare filename otherwise.
    fn render_nav_xhtml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str("<!DOCTYPE html>\n");
        out.push_str(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\" \
             xmlns:epub=\"http://www.idpf.org/2007/ops\">\n",
        );
        out.push_str("<head>\n  <title>Table of Contents</title>\n</head>\n<body>\n");
        out.push_str("<nav epub:type=\"toc\" id=\"toc\">\n");
        out.push_str("<h1>Table of Contents</h1>\n<ol>\n");
        for chapter in self.chapters {
            out.push_str(&format!(
                "  <li><a href=\"{}\">{}</a></li>\n",
                xml_escape(&chapter_href(chapter)),
                xml_escape(&chapter.title)
            ));
        }
        out.push_str("</ol>\n</nav>\n</body>\n</html>\n");
        out
    }

    fn render_toc_ncx(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str(
            "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \
             \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
        );
        out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
        out.push_str("<head>\n");
        out.push_str(&format!(
            "  <meta name=\"dtb:uid\" content=\"{}\" />\n",
            xml_escape(&self.metadata.isbn)
        ));
        out.push_str("  <meta name=\"dtb:depth\" content=\"1\" />\n");
        out.push_str("  <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
        out.push_str("  <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
        out.push_str("</head>\n");
        out.push_str(&format!(
            "<docTitle><text>{}</text></docTitle>\n",
            xml_escape(&self.metadata.title)
        ));
        out.push_str(&format!(
            "<docAuthor><text>{}</text></docAuthor>\n",
            xml_escape(&self.metadata.authors.join(", "))
        ));
        out.push_str("<navMap>\n");
        for (index, chapter) in self.chapters.iter().enumerate() {
            let order = index + 1;
            out.push_str(&format!(
                "  <navPoint id=\"navPoint-{order}\" playOrder=\"{order}\">\n"
            ));
            out.push_str(&format!(
                "    <navLabel><text>{}</text></navLabel>\n",
                xml_escape(&chapter.title)
            ));
            out.push_str(&format!(
                "    <content src=\"{}\" />\n",
                xml_escape(&chapter_href(chapter))
            ));
            out.push_str("  </navPoint>\n");
        }
        out.push_str("</navMap>\n</ncx>\n");
        out
    }

    /// The package document for one profile.
    fn render_content_opf(&self, profile: Profile) -> Result<String, PackageError> {
        let (images, styles) = self.scan_assets()?;
        let modified = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        out.push_str(
            "<package xmlns=\"http://www.idpf.org/2007/opf\" \
             unique-identifier=\"bookid\" version=\"3.0\">\n",
        );

        out.push_str("<metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
        out.push_str(&format!(
            "  <dc:identifier id=\"bookid\">{}</dc:identifier>\n",
            xml_escape(&self.metadata.isbn)
        ));
        out.push_str(&format!(
            "  <dc:title>{}</dc:title>\n",
            xml_escape(&self.metadata.title)
        ));
        for author in &self.metadata.authors {
            out.push_str(&format!(
                "  <dc:creator>{}</dc:creator>\n",
                xml_escape(author)
            ));
        }
        out.push_str(&format!(
            "  <dc:publisher>{}</dc:publisher>\n",
            xml_escape(&self.metadata.publisher)
        ));
        if !self.metadata.description.is_empty() {
            out.push_str(&format!(
                "  <dc:description>{}</dc:description>\n",
                xml_escape(&self.metadata.description)
            ));
        }
        for subject in &self.metadata.subjects {
            out.push_str(&format!(
                "  <dc:subject>{}</dc:subject>\n",
                xml_escape(subject)
            ));
        }
        if !self.metadata.rights.is_empty() {
            out.push_str(&format!(
                "  <dc:rights>{}</dc:rights>\n",
                xml_escape(&self.metadata.rights)
            ));
        }
        if !self.metadata.release_date.is_empty() {
            out.push_str(&format!(
                "  <dc:date>{}</dc:date>\n",
                xml_escape(&self.metadata.release_date)
            ));
        }
        out.push_str("  <dc:language>en</dc:language>\n");
        out.push_str(&format!(
            "  <dc:source>{}</dc:source>\n",
            xml_escape(&self.metadata.web_url)
        ));
        out.push_str(&format!(
            "  <meta property=\"dcterms:modified\">{modified}</meta>\n"
        ));
        if self.cover_file.is_some() {
            out.push_str("  <meta name=\"cover\" content=\"cover-image\" />\n");
        }
        out.push_str("</metadata>\n");

        out.push_str("<manifest>\n");
        out.push_str(
            "  <item id=\"nav\" href=\"nav.xhtml\" \
             media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
        );
        out.push_str(
            "  <item id=\"ncx\" href=\"toc.ncx\" \
             media-type=\"application/x-dtbncx+xml\" />\n",
        );
        out.push_str(&format!(
            "  <item id=\"main-style\" href=\"Styles/{}\" media-type=\"text/css\" />\n",
            profile.css_filename()
        ));
        if let Some(cover) = self.cover_file {
            out.push_str(&format!(
                "  <item id=\"cover-image\" href=\"Images/{}\" media-type=\"{}\" \
                 properties=\"cover-image\" />\n",
                xml_escape(cover),
                image_media_type(cover)
            ));
            out.push_str(
                "  <item id=\"cover\" href=\"cover.xhtml\" \
                 media-type=\"application/xhtml+xml\" />\n",
            );
        }
        for chapter in self.chapters {
            out.push_str(&format!(
                "  <item id=\"{}\" href=\"{}\" media-type=\"application/xhtml+xml\" />\n",
                manifest_id("c", &chapter.filename),
                xml_escape(&chapter.filename)
            ));
        }
        for image in &images {
            if self.cover_file == Some(image.as_str()) {
                continue;
            }
            out.push_str(&format!(
                "  <item id=\"{}\" href=\"Images/{}\" media-type=\"{}\" />\n",
                manifest_id("img", image),
                xml_escape(image),
                image_media_type(image)
            ));
        }
        for style in &styles {
            out.push_str(&format!(
                "  <item id=\"{}\" href=\"Styles/{}\" media-type=\"text/css\" />\n",
                manifest_id("css", style),
                xml_escape(style)
            ));
        }
        out.push_str("</manifest>\n");

        out.push_str("<spine toc=\"ncx\">\n");
        if self.cover_file.is_some() {
            out.push_str("  <itemref idref=\"cover\" />\n");
        }
        for chapter in self.chapters {
            out.push_str(&format!(
                "  <itemref idref=\"{}\" />\n",
                manifest_id("c", &chapter.filename)
            ));
        }
        out.push_str("</spine>\n");

        if self.cover_file.is_some() {
            out.push_str(
                "<guide><reference type=\"cover\" title=\"Cover\" href=\"cover.xhtml\" />\
                 </guide>\n",
            );
        }
        out.push_str("</package>\n");
        Ok(out)
    }

    /// Lists the on-disk image and stylesheet files, sorted. The manifest
    /// is built from what actually exists, so assets that failed to
    /// download are omitted rather than dangling.
    fn scan_assets(&self) -> Result<(Vec<String>, Vec<String>), PackageError> {
        let images = list_dir_sorted(&self.book_dir.join("OEBPS").join("Images"))?;
        let styles = list_dir_sorted(&self.book_dir.join("OEBPS").join("Styles"))?;
        Ok((images, styles))
    }

    /// Writes the ZIP container for one profile.
    fn zip_package(&self, epub_path: &Path, profile: Profile) -> Result<(), PackageError> {
        let file = File::create(epub_path).map_err(|e| PackageError::io(epub_path, e))?;
        let mut zip = zip::ZipWriter::new(file);

        // The mimetype must be the first entry and must be stored.
        let stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip.start_file("mimetype", stored)
            .map_err(|e| PackageError::zip(epub_path, e))?;
        zip.write_all(b"application/epub+zip")
            .map_err(|e| PackageError::io(epub_path, e))?;

        let deflated = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        zip.start_file("META-INF/container.xml", deflated)
            .map_err(|e| PackageError::zip(epub_path, e))?;
        zip.write_all(CONTAINER_XML.as_bytes())
            .map_err(|e| PackageError::io(epub_path, e))?;

        zip.start_file("OEBPS/content.opf", deflated)
            .map_err(|e| PackageError::zip(epub_path, e))?;
        zip.write_all(self.render_content_opf(profile)?.as_bytes())
            .map_err(|e| PackageError::io(epub_path, e))?;

        // The profile stylesheet lives only inside the container; the
        // shared on-disk tree stays profile-neutral.
        zip.start_file(format!("OEBPS/Styles/{}", profile.css_filename()), deflated)
            .map_err(|e| PackageError::zip(epub_path, e))?;
        zip.write_all(profile.css_content().as_bytes())
            .map_err(|e| PackageError::io(epub_path, e))?;

        let oebps = self.book_dir.join("OEBPS");
        for path in walk_files_sorted(&oebps)? {
            let rel = path
                .strip_prefix(&oebps)
                .map_err(|_| PackageError::io(&path, std::io::Error::other("bad prefix")))?;
            let entry_name = format!("OEBPS/{}", rel.to_string_lossy().replace('\\', "/"));

            zip.start_file(entry_name.as_str(), deflated)
                .map_err(|e| PackageError::zip(epub_path, e))?;
            let mut source = File::open(&path).map_err(|e| PackageError::io(&path, e))?;
            std::io::copy(&mut source, &mut zip).map_err(|e| PackageError::io(&path, e))?;
        }

        zip.finish().map_err(|e| PackageError::zip(epub_path, e))?;
        debug!(path = %epub_path.display(), profile = profile.label(), "container written");
        Ok(())
    }
}

/// Structural check over a built package:
///
/// 1. `mimetype` is the first entry.
/// 2. Every manifest href resolves to an entry in the container.
/// 3. Every spine idref resolves to a manifest id; every chapter appears
///    in the spine exactly once, in order.
/// 4. Every navigation link points at an existing chapter entry, and its
///    fragment (when present) exists in that chapter.
///
/// # Errors
///
/// Returns [`PackageError::Structure`] listing every problem found.
pub fn verify_package(epub_path: &Path, chapters: &[ChapterNode]) -> Result<(), PackageError> {
    let file = File::open(epub_path).map_err(|e| PackageError::io(epub_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| PackageError::zip(epub_path, e))?;

    let mut problems = Vec::new();
    let names: HashSet<String> = archive.file_names().map(ToString::to_string).collect();

    match archive.by_index(0) {
        Ok(first) if first.name() == "mimetype" => {}
        Ok(first) => problems.push(format!("first entry is {}, not mimetype", first.name())),
        Err(_) => problems.push("container is empty".to_string()),
    }
    if !names.contains("META-INF/container.xml") {
        problems.push("missing META-INF/container.xml".to_string());
    }

    let opf = read_entry(&mut archive, "OEBPS/content.opf");
    let Some(opf) = opf else {
        problems.push("missing OEBPS/content.opf".to_string());
        return Err(PackageError::Structure {
            path: epub_path.to_path_buf(),
            problems,
        });
    };

    // Manifest: id → href; every href must exist in the container.
    let mut manifest: HashMap<String, String> = HashMap::new();
    for item in opf.split("<item ").skip(1) {
        let Some(id) = attr_value(item, "id") else {
            continue;
        };
        let Some(href) = attr_value(item, "href") else {
            continue;
        };
        if !names.contains(&format!("OEBPS/{href}")) {
            problems.push(format!("manifest href {href} missing from container"));
        }
        manifest.insert(id, href);
    }

    // Spine: idrefs resolve; chapters appear exactly once, in order.
    let spine_hrefs: Vec<String> = opf
        .split("<itemref ")
        .skip(1)
        .filter_map(|itemref| attr_value(itemref, "idref"))
        .filter_map(|idref| match manifest.get(&idref) {
            Some(href) => Some(href.clone()),
            None => {
                problems.push(format!("spine idref {idref} not in manifest"));
                None
            }
        })
        .collect();
    let chapter_positions: Vec<usize> = chapters
        .iter()
        .filter_map(|chapter| {
            let count = spine_hrefs
                .iter()
                .filter(|href| **href == chapter.filename)
                .count();
            if count != 1 {
                problems.push(format!(
                    "chapter {} appears {count} times in spine",
                    chapter.filename
                ));
                return None;
            }
            spine_hrefs.iter().position(|href| *href == chapter.filename)
        })
        .collect();
    if !chapter_positions.windows(2).all(|pair| pair[0] < pair[1]) {
        problems.push("spine chapters out of canonical order".to_string());
    }

    // Navigation: every target resolves inside the package.
    if let Some(nav) = read_entry(&mut archive, "OEBPS/nav.xhtml") {
        for link in nav.split("<a ").skip(1) {
            let Some(href) = attr_value(link, "href") else {
                continue;
            };
            let (file, fragment) = match href.split_once('#') {
                Some((file, fragment)) => (file.to_string(), Some(fragment.to_string())),
                None => (href, None),
            };
            if !names.contains(&format!("OEBPS/{file}")) {
                problems.push(format!("nav target {file} missing from container"));
                continue;
            }
            if let Some(fragment) = fragment
                && let Some(body) = read_entry(&mut archive, &format!("OEBPS/{file}"))
                && !body.contains(&format!("id=\"{fragment}\""))
            {
                problems.push(format!("nav fragment #{fragment} not found in {file}"));
            }
        }
    } else {
        problems.push("missing OEBPS/nav.xhtml".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PackageError::Structure {
            path: epub_path.to_path_buf(),
            problems,
        })
    }
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

/// The chapter's navigation href: `file#fragment`, fragment omitted when
/// the chapter has none.
fn chapter_href(chapter: &ChapterNode) -> String {
    if chapter.fragment.is_empty() {
        chapter.filename.clone()
    } else {
        format!("{}#{}", chapter.filename, chapter.fragment)
    }
}

/// Cover page: the image centered, capped at 90% of the viewport height.
fn render_cover_xhtml(cover_image: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <title>Cover</title>
  <style type="text/css">
    body {{ margin: 0; padding: 0; text-align: center; }}
    .cover-page img {{ max-height: 90vh; max-width: 100%; width: auto; height: auto; }}
  </style>
</head>
<body>
  <div class="cover-page">
    <img src="Images/{}" alt="Cover" />
  </div>
</body>
</html>
"#,
        xml_escape(cover_image)
    )
}

/// A valid, unique-enough manifest id from a filename.
fn manifest_id(prefix: &str, name: &str) -> String {
    let stem = name.rsplit('/').next().unwrap_or(name);
    let stem = stem.rsplit_once('.').map_or(stem, |(stem, _)| stem);
    let sanitized: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{prefix}_{sanitized}")
}

fn image_media_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

fn list_dir_sorted(dir: &Path) -> Result<Vec<String>, PackageError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| PackageError::io(dir, e))?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn walk_files_sorted(dir: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| PackageError::io(&current, e))?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut body = String::new();
    entry.read_to_string(&mut body).ok()?;
    Some(body)
}

/// Extracts a double-quoted attribute value from a raw tag slice.
fn attr_value(raw: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = raw.find(&marker)? + marker.len();
    let end = raw[start..].find('"')? + start;
    Some(raw[start..end].to_string())
}

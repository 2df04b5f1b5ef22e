//! Lenient chapter-HTML processing.
//!
//! Provider chapter bodies arrive as tag soup: unclosed void elements,
//! unquoted attributes, bare ampersands. Parsing is tolerant here; all
//! strictness lives at the package boundary, where [`to_xhtml_document`]
//! emits well-formed XHTML.
//!
//! The scanner walks raw tags without building a DOM: every operation here
//! (collect refs, rewrite refs, find the first heading, normalize tags) is
//! local to a tag or a text run.

use std::sync::LazyLock;

use regex::Regex;

/// Void elements that must be self-closed in XHTML.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Image file extensions recognized in hrefs and CSS `url()` refs.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "svg", "webp"];

/// `url(...)` references inside CSS.
static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#"url\(\s*['"]?([^'")]+)['"]?\s*\)"#).unwrap()
});

/// An `&` together with the entity it starts, when it starts one. A match
/// of just `&` is a bare ampersand that needs escaping.
static AMPERSAND_OR_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"&(?:[a-zA-Z][a-zA-Z0-9]*;|#[0-9]+;|#x[0-9a-fA-F]+;)?").unwrap()
});

/// Escapes bare ampersands, leaving existing entities untouched.
fn escape_bare_ampersands(value: &str) -> String {
    AMPERSAND_OR_ENTITY
        .replace_all(value, |caps: &regex::Captures<'_>| {
            if &caps[0] == "&" {
                "&amp;".to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// References collected from one chapter body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChapterRefs {
    /// `href` values of `<link rel="stylesheet">` tags, in document order.
    pub stylesheet_hrefs: Vec<String>,
    /// Bodies of inline `<style>` blocks, in document order.
    pub inline_styles: Vec<String>,
    /// `src` values of `<img>` tags, in document order, deduplicated.
    pub image_srcs: Vec<String>,
}

/// One parsed tag: name, attributes, and whether it was self-closing.
#[derive(Debug, Clone)]
struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
}

impl Tag {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.attrs {
            if n.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.attrs.push((name.to_string(), value.to_string()));
    }

    /// Rebuilds the tag with quoted, escaped attribute values, self-closing
    /// void elements.
    fn render(&self) -> String {
        let mut out = String::from("<");
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        if self.self_closing || VOID_TAGS.contains(&self.name.as_str()) {
            out.push_str(" />");
        } else {
            out.push('>');
        }
        out
    }
}

fn escape_attr(value: &str) -> String {
    escape_bare_ampersands(value)
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

fn escape_text(value: &str) -> String {
    escape_bare_ampersands(value)
}

/// Escapes a string for XML text or attribute content.
#[must_use]
pub fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Case-insensitive ASCII substring search. Byte offsets stay valid even
/// when the haystack carries non-ASCII text.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Finds the end of the tag starting at `lt` (a `<`), honoring quotes.
/// Returns the index of the closing `>`, or `None` for a truncated tag.
fn find_tag_end(bytes: &[u8], lt: usize) -> Option<usize> {
    let mut in_quote: Option<u8> = None;
    let mut i = lt + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = in_quote {
            if b == q {
                in_quote = None;
            }
        } else if b == b'"' || b == b'\'' {
            in_quote = Some(b);
        } else if b == b'>' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Parses the inside of a start tag (`name attr=val ...`), tolerantly.
fn parse_tag(raw: &str) -> Option<Tag> {
    let inner = raw.strip_prefix('<')?.strip_suffix('>')?;
    let inner = inner.trim();
    if inner.starts_with(['!', '?', '/']) {
        return None;
    }

    let self_closing = inner.ends_with('/');
    let inner = inner.trim_end_matches('/').trim_end();

    let name_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let name = inner[..name_end].to_lowercase();
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let mut attrs = Vec::new();
    let rest = &inner[name_end..];
    let mut chars = rest.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        // Attribute name.
        let mut name_end = start;
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == '=' {
                name_end = i;
                break;
            }
            chars.next();
            name_end = i + c.len_utf8();
        }
        let attr_name = rest[start..name_end].to_lowercase();
        if attr_name.is_empty() {
            chars.next();
            continue;
        }

        // Skip whitespace before a possible '='.
        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        if chars.peek().is_some_and(|&(_, c)| c == '=') {
            chars.next();
            while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
                chars.next();
            }
            match chars.peek().copied() {
                Some((vstart, quote @ ('"' | '\''))) => {
                    chars.next();
                    let mut vend = vstart + 1;
                    for (i, c) in chars.by_ref() {
                        if c == quote {
                            vend = i;
                            break;
                        }
                        vend = i + c.len_utf8();
                    }
                    value = rest[vstart + 1..vend].to_string();
                }
                Some((vstart, _)) => {
                    let mut vend = vstart;
                    while let Some(&(i, c)) = chars.peek() {
                        if c.is_whitespace() {
                            break;
                        }
                        chars.next();
                        vend = i + c.len_utf8();
                    }
                    value = rest[vstart..vend].to_string();
                }
                None => {}
            }
        }
        attrs.push((attr_name, unescape_basic(&value)));
    }

    Some(Tag {
        name,
        attrs,
        self_closing,
    })
}

/// Reverses the entities the renderer writes, so rewriting is idempotent.
fn unescape_basic(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Extracts the chapter content: the provider's reader container when
/// present, else the `<body>` contents, else the whole input.
#[must_use]
pub fn extract_body(html: &str) -> String {
    if let Some(content) = extract_element(html, "div", Some("sbo-rt-content")) {
        return content;
    }
    if let Some(content) = extract_element(html, "body", None) {
        return content;
    }
    html.to_string()
}

/// Returns the inner content of the first matching element, tracking
/// nesting of same-named tags.
fn extract_element(html: &str, tag_name: &str, id: Option<&str>) -> Option<String> {
    let bytes = html.as_bytes();
    let mut cursor = 0;
    while let Some(rel) = html[cursor..].find('<') {
        let lt = cursor + rel;
        let Some(gt) = find_tag_end(bytes, lt) else {
            return None;
        };
        let raw = &html[lt..=gt];
        cursor = gt + 1;

        let Some(tag) = parse_tag(raw) else {
            continue;
        };
        if tag.name != tag_name {
            continue;
        }
        if let Some(id) = id
            && tag.attr("id") != Some(id)
        {
            continue;
        }
        if tag.self_closing {
            continue;
        }

        // Found the opening tag; scan to its matching close.
        let content_start = cursor;
        let mut depth = 1;
        while let Some(rel) = html[cursor..].find('<') {
            let lt = cursor + rel;
            let Some(gt) = find_tag_end(bytes, lt) else {
                break;
            };
            let raw = &html[lt..=gt];
            let inner = raw.trim_start_matches('<').trim_end_matches('>').trim();
            if let Some(close_name) = inner.strip_prefix('/') {
                if close_name.trim().eq_ignore_ascii_case(tag_name) {
                    depth -= 1;
                    if depth == 0 {
                        return Some(html[content_start..lt].to_string());
                    }
                }
            } else if let Some(nested) = parse_tag(raw)
                && nested.name == tag_name
                && !nested.self_closing
            {
                depth += 1;
            }
            cursor = gt + 1;
        }
        // Unclosed container: take everything after it.
        return Some(html[content_start..].to_string());
    }
    None
}

/// Collects stylesheet links, inline style bodies, and image sources from
/// a chapter document.
#[must_use]
pub fn collect_refs(html: &str) -> ChapterRefs {
    let bytes = html.as_bytes();
    let mut refs = ChapterRefs::default();
    let mut cursor = 0;

    while let Some(rel) = html[cursor..].find('<') {
        let lt = cursor + rel;
        let Some(gt) = find_tag_end(bytes, lt) else {
            break;
        };
        let raw = &html[lt..=gt];
        cursor = gt + 1;

        let Some(tag) = parse_tag(raw) else {
            continue;
        };

        match tag.name.as_str() {
            "link" => {
                let is_stylesheet = tag
                    .attr("rel")
                    .is_some_and(|rel| rel.eq_ignore_ascii_case("stylesheet"));
                if is_stylesheet
                    && let Some(href) = tag.attr("href")
                    && !href.is_empty()
                {
                    refs.stylesheet_hrefs.push(href.to_string());
                }
            }
            "img" => {
                if let Some(src) = tag.attr("src")
                    && !src.is_empty()
                    && !refs.image_srcs.iter().any(|s| s == src)
                {
                    refs.image_srcs.push(src.to_string());
                }
            }
            "style" if !tag.self_closing => {
                if let Some(close) = find_ascii_ci(&html[cursor..], "</style") {
                    let body = html[cursor..cursor + close].trim().to_string();
                    if !body.is_empty() {
                        refs.inline_styles.push(body);
                    }
                    cursor += close;
                }
            }
            _ => {}
        }
    }

    refs
}

/// Whether a URL path looks like an image file.
#[must_use]
pub fn is_image_link(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// The last path segment of a URL, sanitized for use as a local filename.
#[must_use]
pub fn local_image_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let basename = path.rsplit('/').next().unwrap_or(path);
    let sanitized: String = basename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "image".to_string()
    } else {
        sanitized
    }
}

/// Rewrites intra-package references in a chapter body:
///
/// - `<img src>` → `Images/<sanitized basename>`
/// - relative `<a href>` to images → `Images/<basename>`
/// - relative `<a href>` to chapters → basename with `.html` → `.xhtml`,
///   fragment preserved
/// - absolute links into the same book → reduced to their relative form
/// - `mailto:` and off-site absolute links untouched
///
/// Tags pass through the normalizer, so the output body is already
/// well-formed XHTML markup.
#[must_use]
pub fn rewrite_body(html: &str, book_id: &str) -> String {
    transform_tags(html, |tag| {
        match tag.name.as_str() {
            "img" => {
                if let Some(src) = tag.attr("src") {
                    let local = format!("Images/{}", local_image_name(src));
                    tag.set_attr("src", &local);
                }
            }
            "a" => {
                if let Some(href) = tag.attr("href") {
                    let rewritten = rewrite_href(href, book_id);
                    tag.set_attr("href", &rewritten);
                }
            }
            _ => {}
        }
        true
    })
}

fn rewrite_href(href: &str, book_id: &str) -> String {
    if href.starts_with("mailto:") || href.starts_with('#') {
        return href.to_string();
    }

    let is_absolute = href.contains("://");
    if is_absolute {
        // Absolute links into this book collapse to their in-package form;
        // anything else is left alone.
        if !book_id.is_empty()
            && let Some(pos) = href.find(book_id)
        {
            let tail = href[pos + book_id.len()..].trim_start_matches('/');
            if tail.is_empty() {
                return href.to_string();
            }
            return rewrite_href(tail, book_id);
        }
        return href.to_string();
    }

    if is_image_link(href) {
        return format!("Images/{}", local_image_name(href));
    }

    // Cross-chapter link: keep the basename, swap the extension, keep the
    // fragment.
    let (path, fragment) = match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    };
    let basename = path.rsplit('/').next().unwrap_or(path);
    let basename = basename.replace(".html", ".xhtml");
    match fragment {
        Some(fragment) if !fragment.is_empty() => format!("{basename}#{fragment}"),
        _ => basename,
    }
}

/// Ensures the first heading carries an id usable as the chapter's
/// navigation fragment. Returns the (possibly modified) body and the
/// fragment id, empty when the chapter has no heading at all.
#[must_use]
pub fn ensure_heading_fragment(html: &str, chapter_title: &str) -> (String, String) {
    let mut fragment = String::new();
    let mut done = false;

    let out = transform_tags(html, |tag| {
        if done {
            return true;
        }
        if matches!(tag.name.as_str(), "h1" | "h2" | "h3" | "h4" | "h5" | "h6") {
            match tag.attr("id") {
                Some(id) if !id.is_empty() => {
                    fragment = id.to_string();
                }
                _ => {
                    fragment = heading_slug(chapter_title);
                    tag.set_attr("id", &fragment);
                }
            }
            done = true;
        }
        true
    });

    (out, fragment)
}

/// A stable id slug derived from a chapter title.
#[must_use]
pub fn heading_slug(title: &str) -> String {
    let mut slug = String::new();
    let mut prev_dash = false;
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            prev_dash = false;
        } else if !prev_dash && !slug.is_empty() {
            slug.push('-');
            prev_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "section".to_string()
    } else {
        format!("ch-{slug}")
    }
}

/// Normalizes markup to XHTML: rebuilt tags with quoted attributes,
/// self-closed void elements, escaped bare ampersands in text.
#[must_use]
pub fn normalize_xhtml(html: &str) -> String {
    transform_tags(html, |_tag| true)
}

/// Walks every tag, letting `edit` mutate parsed start tags, and rebuilds
/// the document with normalized tags and escaped text runs. Comments,
/// doctypes, processing instructions, and end tags pass through verbatim.
fn transform_tags(html: &str, mut edit: impl FnMut(&mut Tag) -> bool) -> String {
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len() + 64);
    let mut cursor = 0;

    while let Some(rel) = html[cursor..].find('<') {
        let lt = cursor + rel;
        out.push_str(&escape_text(&html[cursor..lt]));

        let Some(gt) = find_tag_end(bytes, lt) else {
            // Truncated tag: emit the rest escaped and stop.
            out.push_str(&escape_text(&html[lt..]));
            return out;
        };
        let raw = &html[lt..=gt];
        cursor = gt + 1;

        match parse_tag(raw) {
            Some(mut tag) => {
                let keep = edit(&mut tag);
                if keep {
                    out.push_str(&tag.render());
                }
                // Raw text elements: copy the content through unmodified up
                // to the closing tag.
                if matches!(tag.name.as_str(), "style" | "script") && !tag.self_closing {
                    let close_marker = format!("</{}", tag.name);
                    if let Some(close) = find_ascii_ci(&html[cursor..], &close_marker) {
                        out.push_str(&html[cursor..cursor + close]);
                        cursor += close;
                    }
                }
            }
            // Comment, doctype, PI, or end tag: pass through.
            None => out.push_str(raw),
        }
    }

    out.push_str(&escape_text(&html[cursor..]));
    out
}

/// Rewrites `url(...)` references in CSS to `../Images/<basename>` and
/// returns the rewritten text plus the original image URLs encountered.
#[must_use]
pub fn rewrite_css_urls(css: &str) -> (String, Vec<String>) {
    let mut images = Vec::new();
    let rewritten = CSS_URL
        .replace_all(css, |caps: &regex::Captures<'_>| {
            let target = caps[1].trim();
            if is_image_link(target) && !target.starts_with("data:") {
                if !images.iter().any(|i| i == target) {
                    images.push(target.to_string());
                }
                format!("url(../Images/{})", local_image_name(target))
            } else {
                caps[0].to_string()
            }
        })
        .into_owned();
    (rewritten, images)
}

/// Wraps a processed chapter body in a strict XHTML document with links to
/// the package stylesheets and any inline style blocks.
#[must_use]
pub fn to_xhtml_document(
    title: &str,
    stylesheet_names: &[String],
    inline_styles: &[String],
    body: &str,
) -> String {
    let mut out = String::with_capacity(body.len() + 512);
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str("<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"en\" xml:lang=\"en\">\n");
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    for name in stylesheet_names {
        out.push_str(&format!(
            "  <link href=\"Styles/{}\" rel=\"stylesheet\" type=\"text/css\" />\n",
            xml_escape(name)
        ));
    }
    for style in inline_styles {
        out.push_str("  <style type=\"text/css\">\n");
        out.push_str(style);
        out.push_str("\n  </style>\n");
    }
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== collect_refs ====================

    #[test]
    fn test_collect_refs_finds_stylesheets_styles_and_images() {
        let html = r#"<html><head>
            <link rel="stylesheet" href="/files/style.css">
            <style>p { color: red; }</style>
        </head><body>
            <img src="graphics/figure1.png" alt="f1">
            <img src="graphics/figure2.png">
            <img src="graphics/figure1.png">
        </body></html>"#;

        let refs = collect_refs(html);
        assert_eq!(refs.stylesheet_hrefs, vec!["/files/style.css"]);
        assert_eq!(refs.inline_styles, vec!["p { color: red; }"]);
        assert_eq!(
            refs.image_srcs,
            vec!["graphics/figure1.png", "graphics/figure2.png"]
        );
    }

    #[test]
    fn test_collect_refs_ignores_non_stylesheet_links() {
        let html = r#"<link rel="icon" href="favicon.ico"><link rel="stylesheet" href="a.css">"#;
        let refs = collect_refs(html);
        assert_eq!(refs.stylesheet_hrefs, vec!["a.css"]);
    }

    #[test]
    fn test_collect_refs_handles_unquoted_attributes() {
        let html = "<img src=pic.png alt=x>";
        let refs = collect_refs(html);
        assert_eq!(refs.image_srcs, vec!["pic.png"]);
    }

    // ==================== extract_body ====================

    #[test]
    fn test_extract_body_prefers_reader_container() {
        let html = r#"<html><body><div id="sbo-rt-content"><p>Real</p></div><p>Chrome</p></body></html>"#;
        assert_eq!(extract_body(html), "<p>Real</p>");
    }

    #[test]
    fn test_extract_body_falls_back_to_body() {
        let html = "<html><head></head><body><p>Text</p></body></html>";
        assert_eq!(extract_body(html), "<p>Text</p>");
    }

    #[test]
    fn test_extract_body_whole_input_when_fragment() {
        assert_eq!(extract_body("<p>Loose</p>"), "<p>Loose</p>");
    }

    #[test]
    fn test_extract_body_nested_divs() {
        let html = r#"<body><div id="sbo-rt-content"><div><p>a</p></div><p>b</p></div></body>"#;
        assert_eq!(extract_body(html), "<div><p>a</p></div><p>b</p>");
    }

    // ==================== rewrite_body ====================

    #[test]
    fn test_rewrite_body_images_to_images_dir() {
        let out = rewrite_body(r#"<img src="assets/graphics/fig-1.png">"#, "123");
        assert!(out.contains(r#"src="Images/fig-1.png""#), "got: {out}");
    }

    #[test]
    fn test_rewrite_body_chapter_links_keep_fragment() {
        let out = rewrite_body(r##"<a href="ch02.html#sec-2">next</a>"##, "123");
        assert!(out.contains(r##"href="ch02.xhtml#sec-2""##), "got: {out}");
    }

    #[test]
    fn test_rewrite_body_relative_dirs_collapse_to_basename() {
        let out = rewrite_body(r#"<a href="../text/ch03.html">ch</a>"#, "123");
        assert!(out.contains(r#"href="ch03.xhtml""#), "got: {out}");
    }

    #[test]
    fn test_rewrite_body_same_book_absolute_link() {
        let out = rewrite_body(
            r#"<a href="https://example.com/library/view/b/999/ch05.html#top">x</a>"#,
            "999",
        );
        assert!(out.contains(r##"href="ch05.xhtml#top""##), "got: {out}");
    }

    #[test]
    fn test_rewrite_body_leaves_offsite_and_mailto() {
        let html = r#"<a href="mailto:a@b.c">m</a><a href="https://other.org/page.html">o</a>"#;
        let out = rewrite_body(html, "123");
        assert!(out.contains(r#"href="mailto:a@b.c""#));
        assert!(out.contains(r#"href="https://other.org/page.html""#));
    }

    #[test]
    fn test_rewrite_body_image_href_goes_to_images() {
        let out = rewrite_body(r#"<a href="graphics/cover.jpg">c</a>"#, "123");
        assert!(out.contains(r#"href="Images/cover.jpg""#), "got: {out}");
    }

    #[test]
    fn test_rewrite_body_fragment_only_link_untouched() {
        let out = rewrite_body(r##"<a href="#note-3">n</a>"##, "123");
        assert!(out.contains(r##"href="#note-3""##), "got: {out}");
    }

    // ==================== ensure_heading_fragment ====================

    #[test]
    fn test_heading_fragment_uses_existing_id() {
        let (out, fragment) =
            ensure_heading_fragment(r#"<h1 id="intro">Introduction</h1>"#, "Introduction");
        assert_eq!(fragment, "intro");
        assert!(out.contains(r#"id="intro""#));
    }

    #[test]
    fn test_heading_fragment_injects_slug_when_missing() {
        let (out, fragment) =
            ensure_heading_fragment("<h2>Getting Started</h2>", "1. Getting Started");
        assert_eq!(fragment, "ch-1-getting-started");
        assert!(out.contains(r#"<h2 id="ch-1-getting-started">"#), "got: {out}");
    }

    #[test]
    fn test_heading_fragment_only_first_heading_touched() {
        let html = "<h1>First</h1><h2>Second</h2>";
        let (out, fragment) = ensure_heading_fragment(html, "T");
        assert_eq!(fragment, "ch-t");
        assert!(out.contains(r#"<h1 id="ch-t">"#));
        assert!(out.contains("<h2>"), "second heading must stay bare: {out}");
    }

    #[test]
    fn test_heading_fragment_empty_without_headings() {
        let (_, fragment) = ensure_heading_fragment("<p>No headings here</p>", "T");
        assert_eq!(fragment, "");
    }

    #[test]
    fn test_heading_slug_edge_cases() {
        assert_eq!(heading_slug("Ch. 1: The Start!"), "ch-ch-1-the-start");
        assert_eq!(heading_slug("***"), "section");
    }

    // ==================== normalize_xhtml ====================

    #[test]
    fn test_normalize_self_closes_void_tags() {
        let out = normalize_xhtml(r#"<p>a<br>b<img src="x.png"></p>"#);
        assert!(out.contains("<br />"), "got: {out}");
        assert!(out.contains(r#"<img src="x.png" />"#), "got: {out}");
    }

    #[test]
    fn test_normalize_quotes_unquoted_attributes() {
        let out = normalize_xhtml("<td colspan=2>x</td>");
        assert!(out.contains(r#"<td colspan="2">"#), "got: {out}");
    }

    #[test]
    fn test_normalize_escapes_bare_ampersands() {
        let out = normalize_xhtml("<p>Fish & Chips &amp; Vinegar</p>");
        assert!(out.contains("Fish &amp; Chips &amp; Vinegar"), "got: {out}");
    }

    #[test]
    fn test_normalize_preserves_comments_and_end_tags() {
        let out = normalize_xhtml("<!-- note --><p>x</p>");
        assert!(out.contains("<!-- note -->"));
        assert!(out.contains("</p>"));
    }

    #[test]
    fn test_normalize_preserves_utf8_text() {
        let out = normalize_xhtml("<p>日本語のテスト</p>");
        assert!(out.contains("日本語のテスト"));
    }

    #[test]
    fn test_normalize_escapes_quotes_in_attr_values() {
        let out = normalize_xhtml(r#"<p title='say "hi"'>x</p>"#);
        assert!(out.contains(r#"title="say &quot;hi&quot;""#), "got: {out}");
    }

    // ==================== CSS ====================

    #[test]
    fn test_rewrite_css_urls_collects_and_rewrites() {
        let css = r#"body { background: url("img/bg.png"); } .x { background: url(img/bg.png); }"#;
        let (rewritten, images) = rewrite_css_urls(css);
        assert_eq!(images, vec!["img/bg.png"]);
        assert!(rewritten.contains("url(../Images/bg.png)"), "got: {rewritten}");
    }

    #[test]
    fn test_rewrite_css_urls_leaves_fonts_alone() {
        let css = "@font-face { src: url(fonts/serif.woff2); }";
        let (rewritten, images) = rewrite_css_urls(css);
        assert!(images.is_empty());
        assert_eq!(rewritten, css);
    }

    // ==================== to_xhtml_document ====================

    #[test]
    fn test_to_xhtml_document_links_styles_in_order() {
        let doc = to_xhtml_document(
            "Chapter 1",
            &["Style00.css".to_string(), "kindle-style.css".to_string()],
            &["p { margin: 0; }".to_string()],
            "<p>Body</p>",
        );
        assert!(doc.starts_with("<?xml version=\"1.0\""));
        assert!(doc.contains("<title>Chapter 1</title>"));
        let first = doc.find("Styles/Style00.css").unwrap();
        let second = doc.find("Styles/kindle-style.css").unwrap();
        assert!(first < second);
        assert!(doc.contains("p { margin: 0; }"));
        assert!(doc.contains("<p>Body</p>"));
        assert!(doc.trim_end().ends_with("</html>"));
    }

    #[test]
    fn test_to_xhtml_document_escapes_title() {
        let doc = to_xhtml_document("Tom & Jerry <3", &[], &[], "<p>x</p>");
        assert!(doc.contains("<title>Tom &amp; Jerry &lt;3</title>"));
    }

    // ==================== misc helpers ====================

    #[test]
    fn test_is_image_link() {
        assert!(is_image_link("a/b/c.PNG"));
        assert!(is_image_link("cover.jpg?w=200"));
        assert!(!is_image_link("chapter.html"));
        assert!(!is_image_link("style.css"));
    }

    #[test]
    fn test_local_image_name_sanitizes() {
        assert_eq!(local_image_name("a/b/fig 1.png"), "fig_1.png");
        assert_eq!(local_image_name("https://h/p/q.png?w=200"), "q.png");
        assert_eq!(local_image_name(""), "image");
    }
}

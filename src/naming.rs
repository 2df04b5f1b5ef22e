//! Naming and filesystem layout: topic folders, manifest file slugs, book
//! folders, EPUB filenames, and the on-disk existence check.
//!
//! The existence check is the authoritative "already downloaded" predicate:
//! a book is present iff the EPUB file(s) for the configured profile exist
//! at the computed path. The progress file is advisory only.

use std::path::Path;

use crate::config::EpubFormat;
use crate::epub::Profile;

/// Acronyms preserved verbatim by the topic folder transform.
const ACRONYMS: &[&str] = &[
    "AI", "ML", "API", "UI", "UX", "SQL", "CSS", "HTML", "JS", "AWS", "GCP",
];

/// Conjunctions and prepositions kept lowercase when not the first word.
const SMALL_WORDS: &[&str] = &["and", "or", "of", "in", "on", "at", "to", "for", "the"];

/// Characters never allowed in file or folder names.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Converts a topic name into its output folder name.
///
/// Forbidden characters and underscores become spaces, whitespace collapses,
/// and the result is Title Cased with a fixed acronym set and lowercase
/// non-initial conjunctions/prepositions.
///
/// # Examples
///
/// ```
/// use skillshelf::naming::topic_folder_name;
///
/// assert_eq!(topic_folder_name("machine_learning"), "Machine Learning");
/// assert_eq!(topic_folder_name("ai_&_ml"), "AI & ML");
/// ```
#[must_use]
pub fn topic_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c == '_' {
                ' '
            } else {
                c
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .enumerate()
        .map(|(idx, token)| title_case_token(token, idx == 0))
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_token(token: &str, initial: bool) -> String {
    let upper = token.to_uppercase();
    if let Some(acronym) = ACRONYMS.iter().find(|a| **a == upper) {
        return (*acronym).to_string();
    }

    let lower = token.to_lowercase();
    if !initial && SMALL_WORDS.contains(&lower.as_str()) {
        return lower;
    }

    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Converts a topic name into the slug used for its manifest file
/// (`{slug}_books.json`): lowercase, separators collapsed to single
/// underscores, trimmed.
#[must_use]
pub fn manifest_file_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sep = false;
    for ch in name.trim().to_lowercase().chars() {
        let is_sep = ch.is_whitespace()
            || FORBIDDEN.contains(&ch)
            || matches!(ch, '&' | '-' | '(' | ')' | '.' | ',');
        if is_sep {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(ch);
            prev_sep = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// Builds the book output folder name: `<sanitized title> (<book id>)`.
///
/// Forbidden characters are replaced with underscores; trailing dots and
/// spaces are trimmed so the name is valid on common filesystems.
#[must_use]
pub fn book_folder_name(title: &str, book_id: &str) -> String {
    let sanitized: String = title
        .trim()
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let name = format!("{sanitized} ({book_id})");
    name.trim_end_matches([' ', '.']).to_string()
}

/// Strips a title or author down to the characters allowed in an EPUB
/// filename (alphanumerics, space, `-`, `_`).
#[must_use]
pub fn epub_name_component(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Builds the EPUB filename for one profile.
///
/// Standard profile: `<title> - <author>.epub`.
/// Reader-optimized profile: `<title> - <author> (Kindle).epub`.
#[must_use]
pub fn epub_file_name(title: &str, first_author: &str, profile: Profile) -> String {
    let title = epub_name_component(title);
    let author = epub_name_component(first_author);
    match profile {
        Profile::Standard => format!("{title} - {author}.epub"),
        Profile::Kindle => format!("{title} - {author} (Kindle).epub"),
    }
}

/// The authoritative skip predicate: true iff every EPUB file required by
/// the configured build format exists in the book folder.
#[must_use]
pub fn is_book_present(
    book_dir: &Path,
    title: &str,
    first_author: &str,
    format: EpubFormat,
) -> bool {
    format
        .profiles()
        .iter()
        .all(|profile| book_dir.join(epub_file_name(title, first_author, *profile)).is_file())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== topic_folder_name ====================

    #[test]
    fn test_topic_folder_name_underscores_become_spaces() {
        assert_eq!(topic_folder_name("machine_learning"), "Machine Learning");
    }

    #[test]
    fn test_topic_folder_name_preserves_acronyms() {
        assert_eq!(topic_folder_name("ai_&_ml"), "AI & ML");
        assert_eq!(topic_folder_name("aws lambda"), "AWS Lambda");
        assert_eq!(topic_folder_name("sql"), "SQL");
    }

    #[test]
    fn test_topic_folder_name_small_words_lowercase_when_not_initial() {
        assert_eq!(
            topic_folder_name("principles of engineering"),
            "Principles of Engineering"
        );
        // Initial small word stays capitalized.
        assert_eq!(topic_folder_name("the art of scala"), "The Art of Scala");
    }

    #[test]
    fn test_topic_folder_name_strips_forbidden_characters() {
        assert_eq!(topic_folder_name("ci/cd pipelines"), "Ci Cd Pipelines");
        assert_eq!(topic_folder_name("what? why: how"), "What Why How");
    }

    #[test]
    fn test_topic_folder_name_collapses_whitespace() {
        assert_eq!(topic_folder_name("  data   science "), "Data Science");
    }

    // ==================== manifest_file_slug ====================

    #[test]
    fn test_manifest_file_slug_lowercases_and_underscores() {
        assert_eq!(manifest_file_slug("Machine Learning"), "machine_learning");
        assert_eq!(manifest_file_slug("AI & ML"), "ai_ml");
    }

    #[test]
    fn test_manifest_file_slug_collapses_runs() {
        assert_eq!(
            manifest_file_slug("C++ (Advanced) - Part A"),
            "c++_advanced_part_a"
        );
    }

    #[test]
    fn test_manifest_file_slug_trims_edges() {
        assert_eq!(manifest_file_slug("  (Rust)  "), "rust");
    }

    // ==================== book_folder_name ====================

    #[test]
    fn test_book_folder_name_appends_id() {
        assert_eq!(
            book_folder_name("Designing Data-Intensive Applications", "9781449373320"),
            "Designing Data-Intensive Applications (9781449373320)"
        );
    }

    #[test]
    fn test_book_folder_name_replaces_forbidden_characters() {
        assert_eq!(
            book_folder_name("Kubernetes: Up & Running", "123"),
            "Kubernetes_ Up & Running (123)"
        );
    }

    #[test]
    fn test_book_folder_name_trims_trailing_dots_and_spaces() {
        let name = book_folder_name("Title.", "id.");
        assert!(!name.ends_with('.'));
        assert!(!name.ends_with(' '));
    }

    // ==================== EPUB filenames ====================

    #[test]
    fn test_epub_file_name_standard() {
        assert_eq!(
            epub_file_name("Fluent Python", "Luciano Ramalho", Profile::Standard),
            "Fluent Python - Luciano Ramalho.epub"
        );
    }

    #[test]
    fn test_epub_file_name_kindle_suffix() {
        assert_eq!(
            epub_file_name("Fluent Python", "Luciano Ramalho", Profile::Kindle),
            "Fluent Python - Luciano Ramalho (Kindle).epub"
        );
    }

    #[test]
    fn test_epub_name_component_drops_punctuation() {
        assert_eq!(
            epub_name_component("C# in Depth: 4th Ed."),
            "C in Depth 4th Ed"
        );
    }

    // ==================== is_book_present ====================

    #[test]
    fn test_is_book_present_requires_both_files_for_dual() {
        let dir = tempfile::tempdir().unwrap();
        let standard = dir
            .path()
            .join(epub_file_name("Title", "Author", Profile::Standard));
        std::fs::write(&standard, b"zip").unwrap();

        assert!(is_book_present(
            dir.path(),
            "Title",
            "Author",
            EpubFormat::Enhanced
        ));
        assert!(!is_book_present(
            dir.path(),
            "Title",
            "Author",
            EpubFormat::Dual
        ));

        let kindle = dir
            .path()
            .join(epub_file_name("Title", "Author", Profile::Kindle));
        std::fs::write(&kindle, b"zip").unwrap();
        assert!(is_book_present(
            dir.path(),
            "Title",
            "Author",
            EpubFormat::Dual
        ));
    }

    #[test]
    fn test_is_book_present_false_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_book_present(
            dir.path(),
            "Title",
            "Author",
            EpubFormat::Kindle
        ));
    }
}

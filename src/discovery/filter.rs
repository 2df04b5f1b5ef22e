//! Content-relevance filter applied to every search candidate.
//!
//! A rejected candidate is not an error; it is silently dropped (logged at
//! debug level only). The rules favor real books over chapter fragments,
//! course shards, and non-English material.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::api::SearchResult;

/// Titles beginning with a structural unit marker.
static STARTS_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)^(chapter|section|lesson|unit|module) ").unwrap()
});

/// Numbered unit markers anywhere in the title (`chapter 7:` and friends).
static NUMBERED_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\b(chapter|section|lesson|unit)\s+\d+:").unwrap()
});

/// `part I:` .. `part V:` and `part 1:` .. `part 5:`. Requires the colon,
/// so titles that merely contain the word "parts" pass.
static NUMBERED_PART: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)\bpart\s+(iv|i{1,3}|v|[1-5]):").unwrap()
});

/// Front/back-matter words that mark a fragment, not a book.
static FRONT_BACK_MATTER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"(?i)\b(appendix|glossary|bibliography|foreword|preface|acknowledgments|wrap-up)\b",
    )
    .unwrap()
});

/// Returns the match variants of a skill name: the original plus its
/// lowercased hyphen, underscore, and plus-joined forms.
///
/// # Examples
///
/// ```
/// use skillshelf::discovery::skill_variants;
///
/// assert_eq!(
///     skill_variants("Machine Learning"),
///     vec![
///         "Machine Learning".to_string(),
///         "machine-learning".to_string(),
///         "machine_learning".to_string(),
///         "machine+learning".to_string(),
///     ]
/// );
/// ```
#[must_use]
pub fn skill_variants(skill: &str) -> Vec<String> {
    let lower = skill.to_lowercase();
    let mut variants = vec![
        skill.to_string(),
        lower.replace(' ', "-"),
        lower.replace(' ', "_"),
        lower.replace(' ', "+"),
    ];
    variants.dedup();
    variants
}

/// Whether an ISBN field holds a usable value (non-empty, not one of the
/// provider's null placeholders).
#[must_use]
pub fn has_valid_isbn(isbn: Option<&str>) -> bool {
    isbn.is_some_and(|isbn| {
        let trimmed = isbn.trim();
        !trimmed.is_empty() && !matches!(trimmed.to_lowercase().as_str(), "n/a" | "none" | "null")
    })
}

/// Whether an ISBN field holds a usable, fully numeric value.
#[must_use]
pub fn has_numeric_isbn(isbn: Option<&str>) -> bool {
    has_valid_isbn(isbn)
        && isbn.is_some_and(|isbn| {
            let trimmed = isbn.trim();
            !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit())
        })
}

/// The per-topic relevance filter.
#[derive(Debug)]
pub struct RelevanceFilter {
    skill: String,
    /// Lowercased variants for subject/topic matching.
    variants: Vec<String>,
}

impl RelevanceFilter {
    /// Builds the filter for one skill.
    #[must_use]
    pub fn new(skill: &str) -> Self {
        let variants = skill_variants(skill)
            .into_iter()
            .map(|variant| variant.to_lowercase())
            .collect();
        Self {
            skill: skill.to_string(),
            variants,
        }
    }

    /// Whether a candidate passes every relevance rule.
    #[must_use]
    pub fn accept(&self, result: &SearchResult) -> bool {
        match self.reject_reason(result) {
            None => true,
            Some(reason) => {
                debug!(
                    skill = %self.skill,
                    title = %result.title,
                    reason,
                    "discover: candidate rejected"
                );
                false
            }
        }
    }

    /// The first rule a candidate violates, or `None` when it is accepted.
    #[must_use]
    pub fn reject_reason(&self, result: &SearchResult) -> Option<&'static str> {
        // 1. Format: books and ebooks only; missing format passes.
        let format = result.format.as_deref().unwrap_or("").to_lowercase();
        if !matches!(format.as_str(), "book" | "ebook" | "") {
            return Some("non-book format");
        }

        // 2. Language: English variants (en, en-us, en-gb, english) or unset.
        let language = result.language.as_deref().unwrap_or("").to_lowercase();
        if !language.is_empty() && !language.starts_with("en") {
            return Some("non-English language");
        }

        // 3. Title length: 5 with a valid ISBN, 10 without.
        let title = result.title.trim();
        let isbn = result.isbn.as_deref();
        let min_len = if has_valid_isbn(isbn) { 5 } else { 10 };
        if title.chars().count() < min_len {
            return Some("title too short");
        }

        // 4. Chapter/fragment title patterns.
        if STARTS_WITH_UNIT.is_match(title) {
            return Some("starts with unit marker");
        }
        if NUMBERED_UNIT.is_match(title)
            || NUMBERED_PART.is_match(title)
            || FRONT_BACK_MATTER.is_match(title)
        {
            return Some("fragment title pattern");
        }

        // 5. Relevance anchor: a numeric ISBN, or a subject/topic label
        //    matching the skill or one of its separator variants.
        if !has_numeric_isbn(isbn) {
            let labels = result.topic_labels();
            let matches_skill = labels
                .iter()
                .any(|label| self.variants.iter().any(|variant| variant == label));
            if !matches_skill {
                return Some("no ISBN and no matching topic");
            }
        }

        None
    }
}

//! Topic catalogue input: the user-selected skills a job operates on.
//!
//! Two on-disk shapes are accepted, matching the catalogues operators
//! already have: a counted list (`{"skills": [{"title": ..., "books": n}]}`)
//! and a flat name → name object with no counts.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// One topic to discover and download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Human label; topic identity is this name, case-sensitive.
    pub name: String,
    /// Expected number of books, when the catalogue knows it. Hints the
    /// discovery page budget; never a hard limit.
    pub expected_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CountedSkill {
    title: String,
    #[serde(default)]
    books: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CountedCatalogue {
    skills: Vec<CountedSkill>,
}

/// Loads the topic catalogue from either supported JSON shape.
///
/// # Errors
///
/// Returns an error when the file is unreadable, not JSON, or neither
/// recognized shape.
pub fn load_topics(path: &Path) -> Result<Vec<Topic>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read skills file '{}'", path.display()))?;
    parse_topics(&raw).with_context(|| format!("failed to parse skills file '{}'", path.display()))
}

fn parse_topics(raw: &str) -> Result<Vec<Topic>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;

    if value.get("skills").is_some_and(serde_json::Value::is_array) {
        let catalogue: CountedCatalogue = serde_json::from_value(value)?;
        return Ok(catalogue
            .skills
            .into_iter()
            .filter(|skill| !skill.title.trim().is_empty())
            .map(|skill| Topic {
                name: skill.title,
                expected_count: skill.books,
            })
            .collect());
    }

    if let serde_json::Value::Object(map) = value {
        let topics: Vec<Topic> = map
            .into_iter()
            .filter_map(|(_, name)| match name {
                serde_json::Value::String(name) if !name.trim().is_empty() => Some(Topic {
                    name,
                    expected_count: None,
                }),
                _ => None,
            })
            .collect();
        if topics.is_empty() {
            bail!("skills file contains no topics");
        }
        return Ok(topics);
    }

    bail!("unrecognized skills file shape: expected a skills list or a name map");
}

/// Orders topics for processing: ascending expected count so quick topics
/// finish first and the ETA stabilizes early; unknown counts go last.
pub fn order_for_processing(topics: &mut [Topic]) {
    topics.sort_by_key(|topic| topic.expected_count.unwrap_or(u64::MAX));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counted_catalogue() {
        let topics = parse_topics(
            r#"{"skills": [{"title": "Python", "books": 666}, {"title": "Rust"}]}"#,
        )
        .unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].name, "Python");
        assert_eq!(topics[0].expected_count, Some(666));
        assert_eq!(topics[1].expected_count, None);
    }

    #[test]
    fn test_parse_flat_name_map() {
        let topics =
            parse_topics(r#"{"Machine Learning": "Machine Learning", "Go": "Go"}"#).unwrap();
        assert_eq!(topics.len(), 2);
        assert!(topics.iter().all(|t| t.expected_count.is_none()));
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(parse_topics("[1, 2]").is_err());
        assert!(parse_topics(r#"{"a": 3}"#).is_err());
    }

    #[test]
    fn test_order_for_processing_smallest_first_unknown_last() {
        let mut topics = vec![
            Topic {
                name: "big".into(),
                expected_count: Some(900),
            },
            Topic {
                name: "unknown".into(),
                expected_count: None,
            },
            Topic {
                name: "small".into(),
                expected_count: Some(12),
            },
        ];
        order_for_processing(&mut topics);
        let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["small", "big", "unknown"]);
    }
}

//! FAQ lookup, consulted before the language model.

use std::{collections::HashSet, path::Path, sync::OnceLock};

use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::locale::normalize_language;

/// Pure question → answer lookup. No side effects.
pub trait FaqMatcher: Send + Sync {
    fn lookup(&self, question: &str, language: &str) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaqEntry {
    pub language: String,
    pub keywords: Vec<String>,
    pub answer: String,
}

/// Matches an entry when every one of its keywords appears as a word in the
/// question. The entry with the most keywords wins.
#[derive(Debug, Clone, Default)]
pub struct KeywordFaq {
    entries: Vec<FaqEntry>,
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid word regex"))
}

fn words(text: &str) -> HashSet<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

impl KeywordFaq {
    pub fn new(entries: Vec<FaqEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let entries = serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FaqMatcher for KeywordFaq {
    fn lookup(&self, question: &str, language: &str) -> Option<String> {
        let language = normalize_language(language);
        let asked = words(question);
        self.entries
            .iter()
            .filter(|entry| normalize_language(&entry.language) == language)
            .filter(|entry| !entry.keywords.is_empty())
            .filter(|entry| {
                entry
                    .keywords
                    .iter()
                    .all(|keyword| asked.contains(&keyword.to_lowercase()))
            })
            .max_by_key(|entry| entry.keywords.len())
            .map(|entry| entry.answer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn faq() -> KeywordFaq {
        KeywordFaq::new(vec![
            FaqEntry {
                language: "en".to_string(),
                keywords: vec!["hours".to_string()],
                answer: "We are open 9 to 5.".to_string(),
            },
            FaqEntry {
                language: "en".to_string(),
                keywords: vec!["weekend".to_string(), "hours".to_string()],
                answer: "We are closed on weekends.".to_string(),
            },
            FaqEntry {
                language: "fr".to_string(),
                keywords: vec!["horaires".to_string()],
                answer: "Nous sommes ouverts de 9h à 17h.".to_string(),
            },
        ])
    }

    #[test]
    fn most_specific_entry_wins() {
        let faq = faq();
        assert_eq!(
            faq.lookup("What are your hours?", "en").as_deref(),
            Some("We are open 9 to 5.")
        );
        assert_eq!(
            faq.lookup("Weekend HOURS please", "en-GB").as_deref(),
            Some("We are closed on weekends.")
        );
    }

    #[test]
    fn language_must_match() {
        let faq = faq();
        assert!(faq.lookup("hours", "fr").is_none());
        assert!(faq.lookup("Quels sont vos horaires ?", "fr").is_some());
    }

    #[test]
    fn partial_words_do_not_match() {
        assert!(faq().lookup("hourslong", "en").is_none());
    }
}

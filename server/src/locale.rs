//! Localization table shared by every component.
//!
//! Loaded once at startup, then passed around behind an `Arc`. Languages
//! without an entry get the generic template with the language code filled in.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleStrings {
    pub language_name: String,
    pub welcome: String,
    pub answer_unavailable: String,
    pub handoff_invitation: String,
    pub guest_name: String,
}

impl LocaleStrings {
    fn fill(&self, language: &str) -> Self {
        let apply = |text: &str| text.replace("{language}", language);
        Self {
            language_name: apply(&self.language_name),
            welcome: apply(&self.welcome),
            answer_unavailable: apply(&self.answer_unavailable),
            handoff_invitation: apply(&self.handoff_invitation),
            guest_name: apply(&self.guest_name),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocaleTableFile {
    #[serde(default)]
    languages: HashMap<String, LocaleStrings>,
    #[serde(default)]
    countries: HashMap<String, String>,
    #[serde(default)]
    generic: Option<LocaleStrings>,
}

#[derive(Debug, Clone)]
pub struct LocaleTable {
    languages: HashMap<String, LocaleStrings>,
    countries: HashMap<String, String>,
    generic: LocaleStrings,
}

pub const DEFAULT_LANGUAGE: &str = "en";

/// Lowercase primary subtag: `"en-US"` and `"EN_us"` both become `"en"`.
pub fn normalize_language(code: &str) -> String {
    code.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

impl LocaleTable {
    pub fn builtin() -> Self {
        let mut languages = HashMap::new();
        languages.insert(
            "en".to_string(),
            LocaleStrings {
                language_name: "English".to_string(),
                welcome: "Welcome! How can we help you today?".to_string(),
                answer_unavailable: "Sorry, I couldn't find an answer to that right now."
                    .to_string(),
                handoff_invitation: "Would you like to talk to one of our agents?".to_string(),
                guest_name: "Guest".to_string(),
            },
        );
        languages.insert(
            "ar".to_string(),
            LocaleStrings {
                language_name: "العربية".to_string(),
                welcome: "أهلاً بك! كيف يمكننا مساعدتك اليوم؟".to_string(),
                answer_unavailable: "عذراً، لم أتمكن من العثور على إجابة الآن.".to_string(),
                handoff_invitation: "هل تود التحدث مع أحد موظفينا؟".to_string(),
                guest_name: "زائر".to_string(),
            },
        );
        languages.insert(
            "fr".to_string(),
            LocaleStrings {
                language_name: "Français".to_string(),
                welcome: "Bienvenue ! Comment pouvons-nous vous aider aujourd'hui ?".to_string(),
                answer_unavailable: "Désolé, je n'ai pas trouvé de réponse pour le moment."
                    .to_string(),
                handoff_invitation: "Souhaitez-vous parler à l'un de nos agents ?".to_string(),
                guest_name: "Invité".to_string(),
            },
        );

        let countries = [
            ("AE", "ar"),
            ("SA", "ar"),
            ("EG", "ar"),
            ("QA", "ar"),
            ("KW", "ar"),
            ("BH", "ar"),
            ("OM", "ar"),
            ("JO", "ar"),
            ("MA", "ar"),
            ("FR", "fr"),
            ("BE", "fr"),
            ("CH", "fr"),
            ("US", "en"),
            ("GB", "en"),
            ("CA", "en"),
            ("AU", "en"),
            ("IN", "en"),
        ]
        .into_iter()
        .map(|(country, lang)| (country.to_string(), lang.to_string()))
        .collect();

        Self {
            languages,
            countries,
            generic: LocaleStrings {
                language_name: "{language}".to_string(),
                welcome: "Welcome! How can we help you today? (language: {language})".to_string(),
                answer_unavailable: "Sorry, no answer is available right now (language: {language})."
                    .to_string(),
                handoff_invitation: "Would you like to talk to one of our agents?".to_string(),
                guest_name: "Guest".to_string(),
            },
        }
    }

    /// Built-in table, overlaid with the JSON file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut table = Self::builtin();
        let Some(path) = path else {
            return Ok(table);
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let file: LocaleTableFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                path: path.display().to_string(),
                source,
            })?;

        for (code, strings) in file.languages {
            table.languages.insert(normalize_language(&code), strings);
        }
        for (country, lang) in file.countries {
            table
                .countries
                .insert(country.trim().to_ascii_uppercase(), normalize_language(&lang));
        }
        if let Some(generic) = file.generic {
            table.generic = generic;
        }
        Ok(table)
    }

    pub fn has_language(&self, code: &str) -> bool {
        self.languages.contains_key(&normalize_language(code))
    }

    pub fn strings(&self, code: &str) -> LocaleStrings {
        let code = normalize_language(code);
        match self.languages.get(&code) {
            Some(strings) => strings.clone(),
            None => self.generic.fill(&code),
        }
    }

    pub fn language_for_country(&self, country: &str) -> Option<&str> {
        self.countries
            .get(&country.trim().to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Pick the room language: the explicit code if present, else the
    /// country's language, else English.
    pub fn resolve_language(&self, language: &str, locale: &str) -> String {
        let explicit = normalize_language(language);
        if !explicit.is_empty() {
            return explicit;
        }
        self.language_for_country(locale)
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string()
    }

    pub fn welcome(&self, code: &str) -> String {
        self.strings(code).welcome
    }

    /// Canned failure reply, always followed by the hand-off invitation so
    /// the visitor has a next step.
    pub fn answer_unavailable(&self, code: &str) -> String {
        let strings = self.strings(code);
        format!("{} {}", strings.answer_unavailable, strings.handoff_invitation)
    }

    pub fn guest_name(&self, code: &str) -> String {
        self.strings(code).guest_name
    }

    pub fn language_name(&self, code: &str) -> String {
        self.strings(code).language_name
    }
}

impl Default for LocaleTable {
    fn default() -> Self {
        Self::builtin()
    }
}

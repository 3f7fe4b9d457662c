//! Configuration loaded from environment variables.

use std::{env, path::PathBuf, time::Duration};

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// Postgres URL. The in-memory store is used when unset.
    pub database_url: Option<String>,
    pub llm: LlmSettings,
    /// Delay between closing a room and purging it, so the close notice is seen.
    pub close_grace: Duration,
    pub locale_table_path: Option<PathBuf>,
    pub faq_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_millis(8_000),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            llm: LlmSettings::default(),
            close_grace: Duration::from_millis(2_000),
            locale_table_path: None,
            faq_path: None,
        }
    }
}

impl Settings {
    /// Load settings from the environment (after `.env`, if present).
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `PORT` | HTTP listen port | `4000` |
    /// | `DATABASE_URL` | Postgres URL | in-memory store |
    /// | `OPENAI_API_KEY` | completion credentials | unset, bot falls back |
    /// | `OPENAI_BASE_URL` | OpenAI-compatible endpoint | `https://api.openai.com/v1` |
    /// | `LLM_MODEL` | completion model | `gpt-4o-mini` |
    /// | `LLM_TIMEOUT_MS` | completion timeout | `8000` |
    /// | `CLOSE_GRACE_MS` | close-to-purge delay | `2000` |
    /// | `LOCALE_TABLE_PATH` | localization overrides (JSON) | unset |
    /// | `FAQ_PATH` | FAQ entries (JSON) | unset |
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let port = parse_var("PORT")?.unwrap_or(defaults.port);
        let llm_timeout = parse_var::<u64>("LLM_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.llm.timeout);
        let close_grace = parse_var::<u64>("CLOSE_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.close_grace);

        Ok(Self {
            port,
            database_url: non_empty_var("DATABASE_URL"),
            llm: LlmSettings {
                api_key: non_empty_var("OPENAI_API_KEY"),
                base_url: non_empty_var("OPENAI_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.llm.base_url),
                model: non_empty_var("LLM_MODEL").unwrap_or(defaults.llm.model),
                timeout: llm_timeout,
            },
            close_grace,
            locale_table_path: non_empty_var("LOCALE_TABLE_PATH").map(PathBuf::from),
            faq_path: non_empty_var("FAQ_PATH").map(PathBuf::from),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },
}

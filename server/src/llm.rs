//! Language-model completion boundary.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::LlmSettings;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("completion service not configured")]
    NotConfigured,

    #[error("completion request failed: {0}")]
    Request(String),

    #[error("completion service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion had empty content")]
    EmptyReply,

    #[error("completion timed out")]
    Timeout,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Complete `user_prompt` under `system_prompt`. `language` is the code
    /// the reply must be written in; the system prompt already spells it out.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        language: &str,
    ) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat completion client.
pub struct OpenAiCompletion {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl OpenAiCompletion {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        language: &str,
    ) -> Result<String, LlmError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(LlmError::NotConfigured);
        };
        tracing::debug!(model = %self.settings.model, language, "requesting completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(api_key)
            .timeout(self.settings.timeout)
            .json(&json!({
                "model": self.settings.model,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_prompt }
                ],
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Request(err.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| LlmError::Request(err.to_string()))?;
        extract_reply(&payload)
    }
}

fn extract_reply(payload: &Value) -> Result<String, LlmError> {
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if text.is_empty() {
        return Err(LlmError::EmptyReply);
    }
    Ok(text.to_string())
}

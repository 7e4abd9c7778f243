//! Gemini `generateContent` language-model client.

use super::{api_error, ChatMessage, CollaboratorError, LanguageModel};
use crate::config::LanguageModelProviderConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiClient {
    pub fn new(client: Client, config: &LanguageModelProviderConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn request_body(messages: &[ChatMessage]) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.as_str(),
                    "parts": [{ "text": m.text }]
                })
            })
            .collect();

        json!({ "contents": contents })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CollaboratorError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::Unavailable("GOOGLE_AI_API_KEY".to_string()))?;

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!(model = %self.model, messages = messages.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(messages))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: GenerateContentResponse = response.json().await?;
        body.into_text()
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse("completion contained no text".to_string())
            })
    }
}

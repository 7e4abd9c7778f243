//! ElevenLabs text-to-speech client. Returns MP3 bytes.

use super::{api_error, CollaboratorError, SpeechSynthesizer};
use crate::config::SpeechSynthesisProviderConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

pub struct ElevenLabsClient {
    client: Client,
    base_url: String,
    model_id: String,
    stability: f32,
    similarity_boost: f32,
    api_key: Option<String>,
}

impl ElevenLabsClient {
    pub fn new(client: Client, config: &SpeechSynthesisProviderConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
            stability: config.stability,
            similarity_boost: config.similarity_boost,
            api_key: config.api_key.clone(),
        }
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": self.stability,
                "similarity_boost": self.similarity_boost,
            }
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, CollaboratorError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::Unavailable("ELEVENLABS_API_KEY".to_string()))?;

        if voice_id.trim().is_empty() {
            return Err(CollaboratorError::InvalidResponse("voice id is empty".to_string()));
        }

        let url = format!("{}/text-to-speech/{}", self.base_url, voice_id);
        debug!(voice_id, chars = text.len(), "Requesting speech synthesis");

        let response = self
            .client
            .post(&url)
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", api_key)
            .json(&self.request_body(text))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "synthesized audio is empty".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

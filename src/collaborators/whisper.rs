//! OpenAI-compatible `/audio/transcriptions` speech-to-text client.

use super::{api_error, CollaboratorError, SpeechRecognizer};
use crate::config::SpeechRecognitionProviderConfig;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

pub struct WhisperApiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

impl WhisperApiClient {
    pub fn new(client: Client, config: &SpeechRecognitionProviderConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

/// Guess the container from magic bytes; the endpoint relies on the file extension.
fn sniff_format(audio: &[u8]) -> (&'static str, &'static str) {
    match audio {
        [b'R', b'I', b'F', b'F', ..] => ("speech.wav", "audio/wav"),
        [b'O', b'g', b'g', b'S', ..] => ("speech.ogg", "audio/ogg"),
        [0x1A, 0x45, 0xDF, 0xA3, ..] => ("speech.webm", "audio/webm"),
        [b'f', b'L', b'a', b'C', ..] => ("speech.flac", "audio/flac"),
        [b'I', b'D', b'3', ..] => ("speech.mp3", "audio/mpeg"),
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => ("speech.mp3", "audio/mpeg"),
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => ("speech.m4a", "audio/mp4"),
        _ => ("speech.webm", "application/octet-stream"),
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperApiClient {
    fn name(&self) -> &str {
        "whisper-api"
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, CollaboratorError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::Unavailable("OPENAI_API_KEY".to_string()))?;

        let (file_name, mime) = sniff_format(audio);
        debug!(bytes = audio.len(), mime, "Requesting transcription");

        let part = Part::bytes(audio.to_vec())
            .file_name(file_name)
            .mime_str(mime)?;
        let form = Form::new().part("file", part).text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: TranscriptionResponse = response.json().await?;
        Ok(body.text.trim().to_string())
    }
}

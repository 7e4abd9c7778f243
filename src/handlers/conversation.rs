//! # Stateless Conversation Endpoints
//!
//! REST counterparts of the WebSocket protocol for clients that keep their own
//! history:
//!
//! - `POST /chat`: `{message, history, systemPrompt}` -> `{response, history}`
//! - `POST /text-to-speech`: `{text, voiceId, format?}` -> `{audio}` (base64
//!   MP3), or a WAV body of the normalized 16 kHz PCM when `format` is `"wav"`
//!
//! Both go through the same collaborators and timeouts as a session turn.

use crate::collaborators::ChatMessage;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(rename = "systemPrompt", alias = "initialPrompt", default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(rename = "voiceId", default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub format: SpeechFormat,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechFormat {
    /// Compressed synthesizer output, base64 in JSON
    #[default]
    Mp3,
    /// Normalized PCM16 at the renderer's sample rate
    Wav,
}

pub async fn chat(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AppError> {
    let ChatRequest {
        message,
        mut history,
        system_prompt,
    } = body.into_inner();

    let message = message.trim().to_string();
    if message.is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }

    let system_prompt = system_prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.get_config().conversation.default_system_prompt);

    let reply = state
        .coordinator
        .complete_once(&system_prompt, &history, &message)
        .await?;
    debug!(history_len = history.len(), chars = reply.len(), "Stateless chat completed");

    history.push(ChatMessage::user(message));
    history.push(ChatMessage::model(reply.as_str()));

    Ok(HttpResponse::Ok().json(json!({
        "response": reply,
        "history": history
    })))
}

pub async fn text_to_speech(
    state: web::Data<AppState>,
    body: web::Json<SpeechRequest>,
) -> Result<HttpResponse, AppError> {
    let SpeechRequest { text, voice_id, format } = body.into_inner();
    if text.trim().is_empty() {
        return Err(AppError::BadRequest("text is required".to_string()));
    }

    let voice_id = voice_id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| state.get_config().conversation.default_voice_id);

    let audio = state.coordinator.synthesize_once(&text, &voice_id).await?;

    match format {
        SpeechFormat::Mp3 => Ok(HttpResponse::Ok().json(json!({ "audio": BASE64.encode(&audio) }))),
        SpeechFormat::Wav => {
            let pcm = state.coordinator.decode(Arc::from(audio)).await?;
            let wav = pcm
                .to_wav()
                .map_err(|e| AppError::Internal(format!("WAV encoding failed: {}", e)))?;
            Ok(HttpResponse::Ok().content_type("audio/wav").body(wav))
        }
    }
}

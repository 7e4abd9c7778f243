//! # External Collaborators
//!
//! The conversation core only depends on three narrow capabilities:
//!
//! - [`LanguageModel`]: `complete(messages) -> text`
//! - [`SpeechSynthesizer`]: `synthesize(text, voice_id) -> compressed audio`
//! - [`SpeechRecognizer`]: `transcribe(audio) -> text`
//!
//! They are injected as trait objects (`Arc<dyn LanguageModel>` and friends),
//! so the HTTP clients in this module can be swapped for test doubles.
//! The avatar renderer is the fourth collaborator; it lives in the front end
//! and is fed through binary WebSocket frames by the gateway.

pub mod elevenlabs;
pub mod gemini;
pub mod whisper;

pub use elevenlabs::ElevenLabsClient;
pub use gemini::GeminiClient;
pub use whisper::WhisperApiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who authored a message in the model-facing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// Also accepted as `assistant`, which is what browser front ends tend to send
    #[serde(alias = "assistant")]
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One entry of the role-tagged history passed to the language model.
///
/// Deserializes from `{role, text}`, `{role, content}`, or the Gemini
/// `{role, parts: [{text}]}` shape; always serializes as `{role, text}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

#[derive(Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default, alias = "content")]
    text: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
struct WirePart {
    #[serde(default)]
    text: String,
}

impl TryFrom<WireMessage> for ChatMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let text = match wire.text {
            Some(text) => text,
            None if !wire.parts.is_empty() => wire.parts.into_iter().map(|p| p.text).collect(),
            None => return Err("message needs `text`, `content`, or `parts`".to_string()),
        };
        Ok(Self { role: wire.role, text })
    }
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Failure of an external collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator is not configured (missing API key, disabled)
    #[error("{0} is not configured")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Text completion over a role-tagged history.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// `messages` is ordered oldest first; the last entry is the new user utterance.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CollaboratorError>;
}

/// Text-to-speech returning compressed audio bytes (MP3 for most providers).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Speech-to-text for raw audio captured by the front end.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &[u8]) -> Result<String, CollaboratorError>;
}

/// Map a non-success HTTP response into [`CollaboratorError::Api`].
pub(crate) async fn api_error(response: reqwest::Response) -> CollaboratorError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    CollaboratorError::Api { status, message }
}

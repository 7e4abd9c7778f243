//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`ConversationError`]: the turn-taking taxonomy. These never cross the
//!   WebSocket unobserved; the gateway serializes every one of them into an
//!   `error` message using [`ConversationError::code`].
//! - [`AppError`]: failures of the REST surface, converted to JSON HTTP
//!   responses through actix's `ResponseError` trait.
//!
//! ## JSON Response Format (REST):
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Port must be greater than 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of the conversation core.
///
/// `SessionBusy` is a rejection of the new request rather than a fault: the
/// turn already in flight continues unaffected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversationError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("A reply is still in progress, please wait before speaking again")]
    SessionBusy,

    #[error("Failed to generate response: {0}")]
    ModelError(String),

    #[error("Failed to generate speech: {0}")]
    SynthesisError(String),

    #[error("Failed to decode speech audio: {0}")]
    AudioDecodeError(String),

    #[error("Failed to transcribe speech: {0}")]
    TranscriptionError(String),

    #[error("Connection error: {0}")]
    TransportError(String),

    #[error("Maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ConversationError {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ConversationError::SessionNotFound(_) => "session_not_found",
            ConversationError::SessionBusy => "session_busy",
            ConversationError::ModelError(_) => "model_error",
            ConversationError::SynthesisError(_) => "synthesis_error",
            ConversationError::AudioDecodeError(_) => "audio_decode_error",
            ConversationError::TranscriptionError(_) => "transcription_error",
            ConversationError::TransportError(_) => "transport_error",
            ConversationError::CapacityExceeded(_) => "capacity_exceeded",
            ConversationError::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Custom error types for the REST endpoints.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Upstream**: A collaborator (language model, speech synthesis) failed (502 errors)
/// - **Unavailable**: Capacity exhausted (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Upstream(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Maps each error to an HTTP status and a consistent JSON body.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Lets the REST handlers reuse the coordinator's building blocks with `?`.
impl From<ConversationError> for AppError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            ConversationError::InvalidInput(_) | ConversationError::SessionBusy => {
                AppError::BadRequest(err.to_string())
            }
            ConversationError::CapacityExceeded(_) => AppError::Unavailable(err.to_string()),
            ConversationError::ModelError(_)
            | ConversationError::SynthesisError(_)
            | ConversationError::TranscriptionError(_) => AppError::Upstream(err.to_string()),
            ConversationError::AudioDecodeError(_) | ConversationError::TransportError(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

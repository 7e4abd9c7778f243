//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nesting levels)
//! - Provider API keys from their conventional variables
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_CONVERSATION__HISTORY_LIMIT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## API keys:
//! Keys are never serialized back out (they are `skip_serializing`) so that
//! `GET /api/v1/config` cannot leak them. They are read from:
//! - `GOOGLE_AI_API_KEY` for the language model
//! - `ELEVENLABS_API_KEY` for speech synthesis
//! - `OPENAI_API_KEY` for speech recognition

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Broken into logical groups so each component only needs to look at the
/// section it cares about (the gateway reads `conversation`, the codec reads
/// `audio`, and so on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub conversation: ConversationConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    pub providers: ProvidersConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Turn-taking settings.
///
/// ## Fields:
/// - `history_limit`: how many prior turns are replayed to the language model
/// - `acknowledgment`: the fixed model-role reply that follows the system prompt
/// - `default_voice_id` / `default_system_prompt`: used when the front end
///   connects without supplying its own
/// - `*_timeout_secs`: upper bound on each collaborator call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub history_limit: usize,
    pub acknowledgment: String,
    pub default_voice_id: String,
    pub default_system_prompt: String,
    pub model_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    pub transcription_timeout_secs: u64,
}

/// Output format expected by the avatar renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub target_sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of simultaneously open conversation sessions
    pub max_concurrent_sessions: usize,
}

/// Endpoints and models of the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub language_model: LanguageModelProviderConfig,
    pub speech_synthesis: SpeechSynthesisProviderConfig,
    pub speech_recognition: SpeechRecognitionProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageModelProviderConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSynthesisProviderConfig {
    pub base_url: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRecognitionProviderConfig {
    /// When false, inbound `audio` messages are rejected with a transcription error
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

/// Provides default configuration values.
///
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            conversation: ConversationConfig {
                history_limit: 10,
                acknowledgment: "I understand. I'll follow these instructions.".to_string(),
                default_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                default_system_prompt:
                    "You are a friendly assistant. Keep your answers short and conversational."
                        .to_string(),
                model_timeout_secs: 30,
                synthesis_timeout_secs: 30,
                transcription_timeout_secs: 30,
            },
            audio: AudioConfig {
                target_sample_rate: 16000,  // Avatar renderer expects 16kHz
                channels: 1,                // Mono
                bit_depth: 16,              // PCM16
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
            providers: ProvidersConfig {
                language_model: LanguageModelProviderConfig {
                    base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                    model: "gemini-2.0-flash-exp".to_string(),
                    api_key: None,
                },
                speech_synthesis: SpeechSynthesisProviderConfig {
                    base_url: "https://api.elevenlabs.io/v1".to_string(),
                    model_id: "eleven_turbo_v2_5".to_string(),
                    stability: 0.5,
                    similarity_boost: 0.5,
                    api_key: None,
                },
                speech_recognition: SpeechRecognitionProviderConfig {
                    enabled: false,
                    base_url: "https://api.openai.com/v1".to_string(),
                    model: "whisper-1".to_string(),
                    api_key: None,
                },
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    /// 5. Pick up provider API keys
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_CONVERSATION__HISTORY_LIMIT=20`: Replay more turns to the model
    /// - `APP_PROVIDERS__SPEECH_RECOGNITION__ENABLED=true`: Accept raw audio input
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms commonly set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.apply_key_overrides();
        Ok(config)
    }

    /// Read provider API keys from their conventional environment variables.
    fn apply_key_overrides(&mut self) {
        if let Ok(key) = env::var("GOOGLE_AI_API_KEY") {
            self.providers.language_model.api_key = Some(key);
        }
        if let Ok(key) = env::var("ELEVENLABS_API_KEY") {
            self.providers.speech_synthesis.api_key = Some(key);
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.providers.speech_recognition.api_key = Some(key);
        }
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one session may be open
    /// - The renderer format is the one the codec adapter produces (mono PCM16)
    /// - Every collaborator call has a non-zero timeout
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("Target sample rate must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono output is supported, got {} channels",
                self.audio.channels
            ));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit output is supported, got {} bits",
                self.audio.bit_depth
            ));
        }

        let conversation = &self.conversation;
        if conversation.model_timeout_secs == 0
            || conversation.synthesis_timeout_secs == 0
            || conversation.transcription_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Collaborator timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are touched. For example,
    /// `{"conversation": {"history_limit": 4}}` changes only the history cutoff.
    /// Server host/port are accepted but only take effect after a restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(conversation) = partial_config.get("conversation") {
            let target = &mut self.conversation;
            if let Some(limit) = conversation.get("history_limit").and_then(|v| v.as_u64()) {
                target.history_limit = limit as usize;
            }
            if let Some(ack) = conversation.get("acknowledgment").and_then(|v| v.as_str()) {
                target.acknowledgment = ack.to_string();
            }
            if let Some(voice) = conversation.get("default_voice_id").and_then(|v| v.as_str()) {
                target.default_voice_id = voice.to_string();
            }
            if let Some(prompt) = conversation
                .get("default_system_prompt")
                .and_then(|v| v.as_str())
            {
                target.default_system_prompt = prompt.to_string();
            }
            if let Some(secs) = conversation.get("model_timeout_secs").and_then(|v| v.as_u64()) {
                target.model_timeout_secs = secs;
            }
            if let Some(secs) = conversation
                .get("synthesis_timeout_secs")
                .and_then(|v| v.as_u64())
            {
                target.synthesis_timeout_secs = secs;
            }
            if let Some(secs) = conversation
                .get("transcription_timeout_secs")
                .and_then(|v| v.as_u64())
            {
                target.transcription_timeout_secs = secs;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl ConversationConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }
}

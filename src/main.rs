//! # Persona Voice Backend - Main Application Entry Point
//!
//! Actix-web server that runs spoken conversations between a browser front
//! end and a talking-avatar persona.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the whole server is asynchronous
//! - **trait objects**: the language model, speech synthesis, and speech
//!   recognition clients are plugged in as `Arc<dyn Trait>`
//! - **Arc & RwLock**: thread-safe shared state
//! - **actors**: one WebSocket actor per connection
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **error**: conversation and HTTP error types
//! - **audio**: compressed speech -> 16 kHz PCM16 for the avatar renderer
//! - **collaborators**: Gemini, ElevenLabs, and Whisper-compatible HTTP clients
//! - **conversation**: session store and turn coordinator
//! - **gateway**: the `/ws/conversation` WebSocket protocol
//! - **state**, **health**, **middleware**, **handlers**: REST surface and metrics

mod audio;          // Audio decoding and normalization (audio/ directory)
mod collaborators;  // External language/speech services (collaborators/ directory)
mod config;         // Configuration management (config.rs)
mod conversation;   // Sessions and the turn state machine (conversation/ directory)
mod error;          // Error handling types (error.rs)
mod gateway;        // WebSocket conversation protocol (gateway.rs)
mod handlers;       // HTTP request handlers (handlers/ directory)
mod health;         // Health check endpoints (health.rs)
mod middleware;     // Request metrics (middleware.rs)
mod state;          // Application state management (state.rs)

use crate::audio::{processor::AudioProcessor, AudioCodecAdapter};
use crate::collaborators::{
    ElevenLabsClient, GeminiClient, LanguageModel, SpeechSynthesizer, WhisperApiClient,
};
use crate::config::AppConfig;
use crate::conversation::{CoordinatorSettings, SessionStore, TurnCoordinator};
use crate::state::AppState;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Wires the collaborators** into the turn coordinator
/// 4. **Configures the HTTP server** with middleware, REST routes, and the WebSocket
/// 5. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting persona-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let coordinator = build_coordinator(&config)?;
    let app_state = AppState::new(config.clone(), Arc::new(coordinator));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(16 * 1024 * 1024))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/chat", web::post().to(handlers::chat))
                    .route("/text-to-speech", web::post().to(handlers::text_to_speech)),
            )
            .route("/ws/conversation", web::get().to(gateway::conversation_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .shutdown_timeout(10)
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; when unset it defaults to
/// `persona_voice_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Build the HTTP clients and the coordinator that drives every session.
///
/// Missing API keys are not fatal: the affected collaborator reports itself
/// unavailable per call, which surfaces as a `model_error` or `synthesis_error`.
fn build_coordinator(config: &AppConfig) -> Result<TurnCoordinator> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let providers = &config.providers;
    if providers.language_model.api_key.is_none() {
        warn!("GOOGLE_AI_API_KEY is not set; language model calls will fail");
    }
    if providers.speech_synthesis.api_key.is_none() {
        warn!("ELEVENLABS_API_KEY is not set; replies will be delivered as text only");
    }

    let model: Arc<dyn LanguageModel> =
        Arc::new(GeminiClient::new(http.clone(), &providers.language_model));
    let synthesizer: Arc<dyn SpeechSynthesizer> =
        Arc::new(ElevenLabsClient::new(http.clone(), &providers.speech_synthesis));

    let coordinator = TurnCoordinator::new(
        Arc::new(SessionStore::new(config.performance.max_concurrent_sessions)),
        model,
        synthesizer,
        AudioCodecAdapter::new(AudioProcessor::from_config(&config.audio)),
        CoordinatorSettings::from(&config.conversation),
    );

    if providers.speech_recognition.enabled {
        info!(model = %providers.speech_recognition.model, "Speech recognition enabled");
        let recognizer = WhisperApiClient::new(http, &providers.speech_recognition);
        Ok(coordinator.with_recognizer(Arc::new(recognizer)))
    } else {
        Ok(coordinator)
    }
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

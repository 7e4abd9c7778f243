//! # Conversation WebSocket Gateway
//!
//! Front ends connect to `/ws/conversation` and exchange JSON messages with the
//! server. Each connection is one [`ConversationSocket`] actor that owns one
//! session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: optional `voiceId` and `systemPrompt` query parameters
//!    create the session immediately; otherwise the first message creates it
//! 2. **Utterance**: `{"type": "utterance", "text": "..."}` starts a turn
//!    (`"type": "text"` and `initialPrompt` are accepted too)
//! 3. **Response**: a JSON `response` followed by one binary frame of 16 kHz
//!    mono PCM16 (little-endian) for the avatar renderer
//! 4. **Errors**: `{"type": "error", "code": "...", "message": "..."}`; the
//!    connection stays open
//! 5. **Teardown**: `end_session` or closing the socket destroys the session
//!
//! ## Rust Concepts:
//! - **Actor model**: each connection handles its messages one at a time,
//!   which gives per-session ordering for free
//! - **ctx.spawn**: turn futures belong to the actor, so they are dropped
//!   (and their HTTP calls cancelled) when the actor stops

use crate::collaborators::ChatMessage;
use crate::conversation::{
    turns_from_messages, PendingTurn, SessionId, TurnCoordinator, TurnOutcome,
};
use crate::error::ConversationError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages sent by the front end.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// A finalized speech-to-text result
    #[serde(rename = "utterance", alias = "text")]
    Utterance {
        text: String,
        #[serde(rename = "voiceId", default)]
        voice_id: Option<String>,
        #[serde(rename = "systemPrompt", alias = "initialPrompt", default)]
        system_prompt: Option<String>,
        /// Earlier exchanges replayed by a reconnecting client
        #[serde(default)]
        history: Vec<ChatMessage>,
    },

    /// Raw recorded speech, base64 encoded (a `data:` URI prefix is allowed)
    #[serde(rename = "audio")]
    Audio {
        audio: String,
        #[serde(rename = "voiceId", default)]
        voice_id: Option<String>,
        #[serde(rename = "systemPrompt", alias = "initialPrompt", default)]
        system_prompt: Option<String>,
    },

    #[serde(rename = "end_session")]
    EndSession,

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: u64,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages sent to the front end.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Turn result. `audio` is the synthesizer's compressed output, base64
    /// encoded, or `null` when synthesis failed.
    #[serde(rename = "response")]
    Response {
        text: String,
        audio: Option<String>,
        #[serde(rename = "userMessage")]
        user_message: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        /// Length of the binary PCM frame that follows, 0 when none follows
        #[serde(rename = "pcmSamples")]
        pcm_samples: usize,
    },

    #[serde(rename = "error")]
    Error { message: String, code: String },

    #[serde(rename = "session_status")]
    SessionStatus {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn from_error(err: &ConversationError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn from_outcome(outcome: &TurnOutcome, sample_rate: u32) -> Self {
        ServerMessage::Response {
            text: outcome.reply_text.clone(),
            audio: outcome.audio.as_ref().map(|bytes| BASE64.encode(bytes)),
            user_message: outcome.user_text.clone(),
            sample_rate,
            pcm_samples: outcome.pcm.as_ref().map(|pcm| pcm.len()).unwrap_or(0),
        }
    }
}

/// Decode an inbound base64 audio payload, tolerating a `data:...;base64,` prefix.
pub fn decode_audio_payload(payload: &str) -> Result<Vec<u8>, ConversationError> {
    let encoded = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };

    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| ConversationError::InvalidInput(format!("audio is not valid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(ConversationError::InvalidInput("audio payload is empty".to_string()));
    }
    Ok(bytes)
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "voiceId")]
    pub voice_id: Option<String>,
    #[serde(rename = "systemPrompt", alias = "initialPrompt")]
    pub system_prompt: Option<String>,
}

/// WebSocket actor bridging one front end to the turn coordinator.
pub struct ConversationSocket {
    state: web::Data<AppState>,
    coordinator: Arc<TurnCoordinator>,

    /// Voice and prompt from the query string, consumed in `started`
    connect_profile: Option<(String, String)>,

    session_id: Option<SessionId>,

    /// The turn future currently running on this actor, if any
    in_flight: Option<SpawnHandle>,

    last_heartbeat: Instant,
}

impl ConversationSocket {
    pub fn new(state: web::Data<AppState>, query: ConnectQuery) -> Self {
        let connect_profile = match (query.voice_id, query.system_prompt) {
            (Some(voice), Some(prompt)) if !voice.trim().is_empty() => Some((voice, prompt)),
            _ => None,
        };

        Self {
            coordinator: state.coordinator.clone(),
            state,
            connect_profile,
            session_id: None,
            in_flight: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize outbound message: {}", e),
        }
    }

    fn send_error(&self, err: &ConversationError, ctx: &mut ws::WebsocketContext<Self>) {
        self.send(&ServerMessage::from_error(err), ctx);
    }

    /// Return the connection's session, creating it on first use.
    ///
    /// The voice and prompt are fixed once the session exists; later values
    /// in messages are ignored.
    fn ensure_session(
        &mut self,
        voice_id: Option<String>,
        system_prompt: Option<String>,
        history: &[ChatMessage],
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Result<SessionId, ConversationError> {
        if let Some(id) = &self.session_id {
            return Ok(id.clone());
        }

        let defaults = self.state.get_config().conversation;
        let voice_id = voice_id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.default_voice_id);
        let system_prompt = system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(defaults.default_system_prompt);

        self.open_session(voice_id, system_prompt, history, ctx)
    }

    fn open_session(
        &mut self,
        voice_id: String,
        system_prompt: String,
        history: &[ChatMessage],
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Result<SessionId, ConversationError> {
        let prior = turns_from_messages(history);
        let restored = prior.len();
        let id = self
            .coordinator
            .sessions()
            .create_seeded(voice_id.as_str(), system_prompt, prior)?;

        info!(
            session_id = %id,
            voice_id = %voice_id,
            restored_turns = restored,
            "Conversation session started"
        );
        self.session_id = Some(id.clone());
        self.send(
            &ServerMessage::SessionStatus {
                session_id: id.clone(),
                status: "started".to_string(),
            },
            ctx,
        );
        Ok(id)
    }

    fn end_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.in_flight.take() {
            ctx.cancel_future(handle);
        }

        if let Some(id) = self.session_id.take() {
            self.coordinator.sessions().destroy(&id);
            info!(session_id = %id, "Conversation session ended");
            self.send(
                &ServerMessage::SessionStatus {
                    session_id: id,
                    status: "ended".to_string(),
                },
                ctx,
            );
        }
    }

    fn handle_utterance(
        &mut self,
        text: String,
        voice_id: Option<String>,
        system_prompt: Option<String>,
        history: Vec<ChatMessage>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Result<(), ConversationError> {
        let session_id = self.ensure_session(voice_id, system_prompt, &history, ctx)?;
        let pending = self.coordinator.begin_turn(&session_id, &text)?;
        self.spawn_turn(pending, None, ctx);
        Ok(())
    }

    fn handle_audio(
        &mut self,
        audio: String,
        voice_id: Option<String>,
        system_prompt: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Result<(), ConversationError> {
        let bytes = decode_audio_payload(&audio)?;
        let session_id = self.ensure_session(voice_id, system_prompt, &[], ctx)?;
        let pending = self.coordinator.begin_audio_turn(&session_id)?;
        self.spawn_turn(pending, Some(bytes), ctx);
        Ok(())
    }

    /// Run the async part of a turn on this actor's context.
    fn spawn_turn(
        &mut self,
        pending: PendingTurn,
        audio: Option<Vec<u8>>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let coordinator = self.coordinator.clone();
        let turn = async move {
            match audio {
                Some(bytes) => coordinator.run_audio_turn(pending, &bytes).await,
                None => coordinator.run_turn(pending).await,
            }
        };

        let handle = ctx.spawn(turn.into_actor(self).map(|result, act, ctx| {
            act.in_flight = None;
            act.deliver(result, ctx);
        }));
        self.in_flight = Some(handle);
    }

    /// Push a turn result to the front end.
    fn deliver(
        &mut self,
        result: Result<TurnOutcome, ConversationError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        match result {
            Ok(outcome) => {
                if self.session_id.as_deref() != Some(outcome.session_id.as_str()) {
                    debug!(
                        session_id = %outcome.session_id,
                        "Dropping result for a session this socket no longer owns"
                    );
                    return;
                }

                self.state.record_turn(outcome.is_degraded());
                let sample_rate = self.coordinator.codec().target_sample_rate();
                self.send(&ServerMessage::from_outcome(&outcome, sample_rate), ctx);

                if let Some(pcm) = &outcome.pcm {
                    ctx.binary(pcm.to_le_bytes());
                }
                if let Some(degradation) = &outcome.degradation {
                    self.send_error(degradation, ctx);
                }
            }
            Err(ConversationError::SessionNotFound(id)) => {
                debug!(session_id = %id, "Turn finished after its session was destroyed");
            }
            Err(err) => {
                self.state.record_turn(true);
                self.send_error(&err, ctx);
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                let err = ConversationError::InvalidInput(format!("invalid message: {}", err));
                self.send_error(&err, ctx);
                return;
            }
        };

        let result = match message {
            ClientMessage::Utterance {
                text,
                voice_id,
                system_prompt,
                history,
            } => self.handle_utterance(text, voice_id, system_prompt, history, ctx),
            ClientMessage::Audio {
                audio,
                voice_id,
                system_prompt,
            } => self.handle_audio(audio, voice_id, system_prompt, ctx),
            ClientMessage::EndSession => {
                self.end_session(ctx);
                Ok(())
            }
            ClientMessage::Ping { timestamp } => {
                self.send(&ServerMessage::Pong { timestamp }, ctx);
                Ok(())
            }
            ClientMessage::Pong { .. } => Ok(()),
        };

        if let Err(err) = result {
            if err != ConversationError::SessionBusy {
                warn!(
                    session_id = ?self.session_id,
                    code = err.code(),
                    "Rejected client message: {}",
                    err
                );
            }
            self.send_error(&err, ctx);
        }
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.record_connection();

        if let Some((voice_id, system_prompt)) = self.connect_profile.take() {
            if let Err(err) = self.open_session(voice_id, system_prompt, &[], ctx) {
                warn!("Refusing conversation connection: {}", err);
                self.send_error(&err, ctx);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Again,
                    description: Some(err.to_string()),
                }));
                ctx.stop();
                return;
            }
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    session_id = ?act.session_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(id) = self.session_id.take() {
            self.coordinator.sessions().destroy(&id);
            info!(session_id = %id, "WebSocket closed, session destroyed");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                let err = ConversationError::InvalidInput(
                    "binary frames are not accepted; send an audio message".to_string(),
                );
                self.send_error(&err, ctx);
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = ?self.session_id, "WebSocket close requested: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                let err = ConversationError::TransportError(err.to_string());
                error!(session_id = ?self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/conversation`: upgrade to a [`ConversationSocket`].
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<ConnectQuery>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default();

    debug!(
        peer = ?req.connection_info().peer_addr(),
        has_profile = query.voice_id.is_some() && query.system_prompt.is_some(),
        "Conversation WebSocket requested"
    );

    ws::start(ConversationSocket::new(state, query), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::coordinator::tests::{FakeModel, FakeSynthesizer};
    use crate::conversation::TurnState;
    use crate::state::tests::state_with;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_parse_utterance_and_aliases() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"text","text":"Hello","initialPrompt":"Be brief","voiceId":"v1"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Utterance {
                text,
                voice_id,
                system_prompt,
                history,
            } => {
                assert_eq!(text, "Hello");
                assert_eq!(voice_id.as_deref(), Some("v1"));
                assert_eq!(system_prompt.as_deref(), Some("Be brief"));
                assert!(history.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "utterance",
            "text": "Hi",
            "history": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"}
            ]
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Utterance { ref history, .. } if history.len() == 2));
    }

    #[test]
    fn test_parse_control_messages() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"end_session"}"#).unwrap(),
            ClientMessage::EndSession
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping","timestamp":42}"#).unwrap(),
            ClientMessage::Ping { timestamp: 42 }
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_response_serialization() {
        let outcome = TurnOutcome {
            session_id: "s".to_string(),
            user_text: "Hello".to_string(),
            reply_text: "Hi there".to_string(),
            audio: None,
            pcm: None,
            degradation: Some(ConversationError::SynthesisError("down".to_string())),
        };
        let json = serde_json::to_value(ServerMessage::from_outcome(&outcome, 16000)).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["text"], "Hi there");
        assert_eq!(json["userMessage"], "Hello");
        assert!(json["audio"].is_null());
        assert_eq!(json["pcmSamples"], 0);

        let busy = ServerMessage::from_error(&ConversationError::SessionBusy);
        let err = serde_json::to_value(busy).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "session_busy");
    }

    #[test]
    fn test_decode_audio_payload() {
        let encoded = BASE64.encode(b"RIFF....");
        assert_eq!(decode_audio_payload(&encoded).unwrap(), b"RIFF....");

        let data_uri = format!("data:audio/webm;codecs=opus;base64,{}", encoded);
        assert_eq!(decode_audio_payload(&data_uri).unwrap(), b"RIFF....");

        assert!(decode_audio_payload("***").is_err());
        assert!(decode_audio_payload("").is_err());
    }

    async fn start_server(state: AppState) -> std::net::SocketAddr {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws/conversation", web::get().to(conversation_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        addr
    }

    async fn next_json<S>(socket: &mut S) -> serde_json::Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match socket.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn utterance(text: &str) -> Message {
        Message::Text(json!({"type": "utterance", "text": text}).to_string())
    }

    #[actix_web::test]
    async fn test_socket_round_trip_delivers_response_and_pcm() {
        let state = state_with(FakeModel::echo(), FakeSynthesizer::wav(44100));
        let sessions = state.sessions().clone();
        let addr = start_server(state).await;

        let url = format!("ws://{}/ws/conversation?voiceId=voice-1&systemPrompt=Be%20kind", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let status = next_json(&mut socket).await;
        assert_eq!(status["type"], "session_status");
        assert_eq!(status["status"], "started");
        assert_eq!(sessions.active_count(), 1);

        socket
            .send(Message::Text(r#"{"type":"utterance","text":"Hello"}"#.to_string()))
            .await
            .unwrap();

        let response = next_json(&mut socket).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["text"], "Hi there");
        assert_eq!(response["userMessage"], "Hello");
        assert_eq!(response["sampleRate"], 16000);
        assert!(response["audio"].is_string());

        let pcm_samples = response["pcmSamples"].as_u64().unwrap() as usize;
        match socket.next().await.unwrap().unwrap() {
            Message::Binary(frame) => assert_eq!(frame.len(), pcm_samples * 2),
            other => panic!("expected PCM frame, got {:?}", other),
        }

        socket.send(Message::Text(r#"{"type":"end_session"}"#.to_string())).await.unwrap();
        let ended = next_json(&mut socket).await;
        assert_eq!(ended["status"], "ended");
        assert_eq!(sessions.active_count(), 0);
    }

    #[actix_web::test]
    async fn test_socket_synthesis_failure_sends_text_then_error() {
        let state = state_with(FakeModel::echo(), FakeSynthesizer::failing());
        let addr = start_server(state).await;

        let url = format!("ws://{}/ws/conversation", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let legacy = json!({"type": "text", "text": "Hello", "initialPrompt": "Be kind"});
        socket.send(Message::Text(legacy.to_string())).await.unwrap();

        let status = next_json(&mut socket).await;
        assert_eq!(status["type"], "session_status");

        let response = next_json(&mut socket).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["text"], "Hi there");
        assert!(response["audio"].is_null());

        let error = next_json(&mut socket).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "synthesis_error");
    }

    #[actix_web::test]
    async fn test_socket_reports_invalid_json() {
        let state = state_with(FakeModel::echo(), FakeSynthesizer::wav(441));
        let addr = start_server(state).await;

        let url = format!("ws://{}/ws/conversation", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        socket.send(Message::Text("not json".to_string())).await.unwrap();

        let error = next_json(&mut socket).await;
        assert_eq!(error["code"], "invalid_input");
    }

    #[actix_web::test]
    async fn test_socket_rejects_back_to_back_utterances() {
        let state = state_with(
            FakeModel::slow(Duration::from_millis(200)),
            FakeSynthesizer::wav(4410),
        );
        let addr = start_server(state).await;

        let url = format!("ws://{}/ws/conversation?voiceId=v&systemPrompt=p", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        assert_eq!(next_json(&mut socket).await["status"], "started");

        socket.send(utterance("one")).await.unwrap();
        socket.send(utterance("two")).await.unwrap();

        let busy = next_json(&mut socket).await;
        assert_eq!(busy["type"], "error");
        assert_eq!(busy["code"], "session_busy");

        let response = next_json(&mut socket).await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["text"], "re: one");
        assert_eq!(response["pcmSamples"], 1600);

        match socket.next().await.unwrap().unwrap() {
            Message::Binary(frame) => assert_eq!(frame.len(), 1600 * 2),
            other => panic!("expected PCM frame, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_socket_close_destroys_session_mid_turn() {
        let gate = Arc::new(Notify::new());
        let state = state_with(FakeModel::gated(gate.clone()), FakeSynthesizer::wav(441));
        let sessions = state.sessions().clone();
        let addr = start_server(state).await;

        let url = format!("ws://{}/ws/conversation?voiceId=v&systemPrompt=p", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let status = next_json(&mut socket).await;
        let session_id = status["sessionId"].as_str().unwrap().to_string();
        let session = sessions.get(&session_id).unwrap();

        socket.send(utterance("three")).await.unwrap();
        wait_until(|| session.state() == TurnState::AwaitingModel).await;

        socket.close(None).await.unwrap();
        wait_until(|| sessions.active_count() == 0).await;
        assert!(session.is_closed());
        assert!(sessions.get(&session_id).is_err());

        // The turn future went away with the actor, so releasing the model changes nothing
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.history_len(), 0);
    }
}

//! # Turn Coordinator
//!
//! Drives one turn through `IDLE -> AWAITING_MODEL -> AWAITING_SPEECH ->
//! DELIVERING -> IDLE`, with `FAILED` in between whenever a collaborator lets
//! us down.
//!
//! ## Two-Phase Submission:
//! [`TurnCoordinator::begin_turn`] is synchronous: it does the busy check and
//! the state flip in one step. [`TurnCoordinator::run_turn`] is the async part
//! that talks to the collaborators. The gateway calls `begin_turn` inside its
//! message handler, so two utterances that arrive back to back are ordered by
//! the actor mailbox, and the second one is always the one rejected.
//!
//! ## Failure Policy:
//! - model failure or timeout: the turn is dropped, `ModelError`
//! - synthesis failure or timeout: reply text is still delivered, `SynthesisError`
//! - decode failure: reply text and compressed audio are delivered, `AudioDecodeError`
//! - nothing is retried, and every path ends in `IDLE`
//!
//! ## Rust Concepts:
//! - `Arc<dyn Trait>` collaborators so tests can plug in fakes
//! - `tokio::time::timeout` turns a slow collaborator into an ordinary error
//! - `spawn_blocking` keeps symphonia off the async worker threads

use crate::audio::{AudioCodecAdapter, DecodedAudioBuffer};
use crate::collaborators::{ChatMessage, LanguageModel, SpeechRecognizer, SpeechSynthesizer};
use crate::config::ConversationConfig;
use crate::conversation::session::{turns_from_messages, Session, SessionId, SessionStore, Turn};
use crate::error::ConversationError;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runtime-tunable knobs, refreshed when `PUT /config` changes them.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub history_limit: usize,
    pub acknowledgment: String,
    pub model_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub transcription_timeout: Duration,
}

impl From<&ConversationConfig> for CoordinatorSettings {
    fn from(config: &ConversationConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            acknowledgment: config.acknowledgment.clone(),
            model_timeout: config.model_timeout(),
            synthesis_timeout: config.synthesis_timeout(),
            transcription_timeout: config.transcription_timeout(),
        }
    }
}

/// A turn that passed the busy check and is waiting for [`TurnCoordinator::run_turn`].
#[derive(Debug, Clone)]
pub struct PendingTurn {
    session: Arc<Session>,
    user_text: String,
}

impl PendingTurn {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn user_text(&self) -> &str {
        &self.user_text
    }
}

/// Everything the gateway needs to answer one utterance.
///
/// `degradation` is set when the reply was delivered without usable audio;
/// the gateway sends it as an `error` after the `response`.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub user_text: String,
    pub reply_text: String,
    pub audio: Option<Arc<[u8]>>,
    pub pcm: Option<DecodedAudioBuffer>,
    pub degradation: Option<ConversationError>,
}

impl TurnOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

/// Assemble what the language model sees for one turn.
///
/// Order: system prompt (user role), acknowledgment (model role), the last
/// `limit` finalized turns, then the new utterance. Turns with an empty side
/// contribute only the side that exists.
pub fn build_model_history(
    system_prompt: &str,
    acknowledgment: &str,
    prior_turns: &[Turn],
    limit: usize,
    utterance: &str,
) -> Vec<ChatMessage> {
    let start = prior_turns.len().saturating_sub(limit);
    let recent = &prior_turns[start..];

    let mut messages = Vec::with_capacity(3 + recent.len() * 2);
    messages.push(ChatMessage::user(system_prompt));
    messages.push(ChatMessage::model(acknowledgment));

    for turn in recent {
        if !turn.user_text.is_empty() {
            messages.push(ChatMessage::user(turn.user_text.as_str()));
        }
        if let Some(reply) = turn.assistant_text.as_deref() {
            messages.push(ChatMessage::model(reply));
        }
    }

    messages.push(ChatMessage::user(utterance));
    messages
}

/// The protocol state machine shared by every connection.
pub struct TurnCoordinator {
    sessions: Arc<SessionStore>,
    model: Arc<dyn LanguageModel>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    codec: AudioCodecAdapter,
    settings: RwLock<CoordinatorSettings>,
}

impl TurnCoordinator {
    pub fn new(
        sessions: Arc<SessionStore>,
        model: Arc<dyn LanguageModel>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        codec: AudioCodecAdapter,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            sessions,
            model,
            synthesizer,
            recognizer: None,
            codec,
            settings: RwLock::new(settings),
        }
    }

    /// Enable `audio` messages by attaching a speech-to-text collaborator.
    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn synthesizer(&self) -> &Arc<dyn SpeechSynthesizer> {
        &self.synthesizer
    }

    pub fn codec(&self) -> &AudioCodecAdapter {
        &self.codec
    }

    pub fn accepts_audio(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update_settings(&self, settings: CoordinatorSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Accept an utterance for `session_id` or reject it.
    ///
    /// Fails with `SessionNotFound`, `SessionBusy`, or `InvalidInput` for blank text.
    pub fn begin_turn(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<PendingTurn, ConversationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConversationError::InvalidInput("utterance text is empty".to_string()));
        }

        let session = self.sessions.get(session_id)?;
        session.begin_turn(text.to_string())?;
        debug!(session_id, state = "AWAITING_MODEL", "Turn accepted");

        Ok(PendingTurn {
            session,
            user_text: text.to_string(),
        })
    }

    /// Accept raw speech for `session_id`. The turn's user text stays empty
    /// until [`TurnCoordinator::run_audio_turn`] has a transcript.
    pub fn begin_audio_turn(&self, session_id: &str) -> Result<PendingTurn, ConversationError> {
        if self.recognizer.is_none() {
            return Err(ConversationError::TranscriptionError(
                "speech recognition is not configured".to_string(),
            ));
        }

        let session = self.sessions.get(session_id)?;
        session.begin_turn(String::new())?;
        debug!(session_id, state = "AWAITING_MODEL", "Audio turn accepted");

        Ok(PendingTurn {
            session,
            user_text: String::new(),
        })
    }

    /// `submit_utterance(session_id, text)`: begin and run in one call.
    pub async fn submit_utterance(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<TurnOutcome, ConversationError> {
        let pending = self.begin_turn(session_id, text)?;
        self.run_turn(pending).await
    }

    /// `submit_audio(session_id, audio)`: transcribe, then run a normal turn.
    pub async fn submit_audio(
        &self,
        session_id: &str,
        audio: &[u8],
    ) -> Result<TurnOutcome, ConversationError> {
        let pending = self.begin_audio_turn(session_id)?;
        self.run_audio_turn(pending, audio).await
    }

    /// Transcribe `audio` and continue with [`TurnCoordinator::run_turn`].
    ///
    /// A failed or empty transcription abandons the turn without touching history.
    pub async fn run_audio_turn(
        &self,
        mut pending: PendingTurn,
        audio: &[u8],
    ) -> Result<TurnOutcome, ConversationError> {
        let session = pending.session.clone();
        let Some(recognizer) = self.recognizer.clone() else {
            session.abort_turn();
            return Err(ConversationError::TranscriptionError(
                "speech recognition is not configured".to_string(),
            ));
        };

        let limit = self.settings().transcription_timeout;
        let started = Instant::now();

        let transcript = match timeout(limit, recognizer.transcribe(audio)).await {
            Ok(Ok(text)) => text.trim().to_string(),
            Ok(Err(e)) => {
                session.abort_turn();
                warn!(
                    session_id = %session.id,
                    recognizer = recognizer.name(),
                    "Transcription failed: {}",
                    e
                );
                return Err(ConversationError::TranscriptionError(e.to_string()));
            }
            Err(_) => {
                session.abort_turn();
                warn!(
                    session_id = %session.id,
                    timeout_secs = limit.as_secs(),
                    "Transcription timed out"
                );
                return Err(ConversationError::TranscriptionError(format!(
                    "timed out after {}s",
                    limit.as_secs()
                )));
            }
        };

        if transcript.is_empty() {
            session.abort_turn();
            return Err(ConversationError::TranscriptionError("no speech detected".to_string()));
        }

        if let Err(e) = session.set_user_text(&transcript) {
            debug!(session_id = %session.id, "Discarding transcript for closed session");
            return Err(e);
        }

        debug!(
            session_id = %session.id,
            duration_ms = started.elapsed().as_millis() as u64,
            chars = transcript.len(),
            "Transcribed user audio"
        );

        pending.user_text = transcript;
        self.run_turn(pending).await
    }

    /// The async body of a turn: model, synthesis, decoding, bookkeeping.
    ///
    /// If the session is destroyed while a collaborator call is outstanding,
    /// the result is thrown away and `SessionNotFound` is returned.
    pub async fn run_turn(&self, pending: PendingTurn) -> Result<TurnOutcome, ConversationError> {
        let PendingTurn { session, user_text } = pending;
        let settings = self.settings();
        let started = Instant::now();

        // 1. Language model
        let prior = session.recent_turns(settings.history_limit);
        let messages = build_model_history(
            &session.system_prompt,
            &settings.acknowledgment,
            &prior,
            settings.history_limit,
            &user_text,
        );

        let reply = match self.call_model(&messages, settings.model_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                session.abort_turn();
                warn!(
                    session_id = %session.id,
                    model = self.model.name(),
                    "Language model failed: {}",
                    e
                );
                return Err(e);
            }
        };

        if let Err(e) = session.record_reply(&reply) {
            debug!(session_id = %session.id, "Discarding model reply for closed session");
            return Err(e);
        }
        debug!(
            session_id = %session.id,
            state = "AWAITING_SPEECH",
            duration_ms = started.elapsed().as_millis() as u64,
            "Model replied"
        );

        // 2. Speech synthesis
        let synthesis = self
            .call_synthesizer(&reply, &session.voice_id, settings.synthesis_timeout)
            .await;

        let (audio, pcm, degradation) = match synthesis {
            Ok(bytes) => {
                let audio: Arc<[u8]> = Arc::from(bytes);
                session.record_audio(audio.clone())?;

                // 3. Decode for the avatar renderer
                match self.decode(audio.clone()).await {
                    Ok(buffer) => (Some(audio), Some(buffer), None),
                    Err(e) => {
                        warn!(
                            session_id = %session.id,
                            "Synthesized audio could not be decoded: {}",
                            e
                        );
                        (Some(audio), None, Some(e))
                    }
                }
            }
            Err(error) => {
                warn!(
                    session_id = %session.id,
                    synthesizer = self.synthesizer.name(),
                    "Speech synthesis failed, delivering text only: {}",
                    error
                );
                session.mark_failed()?;
                (None, None, Some(error))
            }
        };

        // 4. Finalize
        if session.is_closed() {
            debug!(session_id = %session.id, "Discarding finished turn for closed session");
            return Err(ConversationError::SessionNotFound(session.id.clone()));
        }
        session.finish_turn(degradation.is_some())?;

        info!(
            session_id = %session.id,
            duration_ms = started.elapsed().as_millis() as u64,
            degraded = degradation.is_some(),
            pcm_samples = pcm.as_ref().map(|b| b.len()).unwrap_or(0),
            "Turn completed"
        );

        Ok(TurnOutcome {
            session_id: session.id.clone(),
            user_text,
            reply_text: reply,
            audio,
            pcm,
            degradation,
        })
    }

    /// One completion outside any session, for `POST /chat`.
    ///
    /// `history` is the browser-style message list; it is paired into turns
    /// and cut to the configured limit like a session history would be.
    pub async fn complete_once(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        message: &str,
    ) -> Result<String, ConversationError> {
        let settings = self.settings();
        let prior = turns_from_messages(history);
        let messages = build_model_history(
            system_prompt,
            &settings.acknowledgment,
            &prior,
            settings.history_limit,
            message,
        );
        self.call_model(&messages, settings.model_timeout).await
    }

    /// One synthesis call outside any session, for `POST /text-to-speech`.
    pub async fn synthesize_once(
        &self,
        text: &str,
        voice_id: &str,
    ) -> Result<Vec<u8>, ConversationError> {
        let limit = self.settings().synthesis_timeout;
        self.call_synthesizer(text, voice_id, limit).await
    }

    async fn call_model(
        &self,
        messages: &[ChatMessage],
        limit: Duration,
    ) -> Result<String, ConversationError> {
        match timeout(limit, self.model.complete(messages)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ConversationError::ModelError(e.to_string())),
            Err(_) => Err(ConversationError::ModelError(timed_out(limit))),
        }
    }

    async fn call_synthesizer(
        &self,
        text: &str,
        voice_id: &str,
        limit: Duration,
    ) -> Result<Vec<u8>, ConversationError> {
        match timeout(limit, self.synthesizer.synthesize(text, voice_id)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(ConversationError::SynthesisError(e.to_string())),
            Err(_) => Err(ConversationError::SynthesisError(timed_out(limit))),
        }
    }

    /// Decode on the blocking pool.
    pub async fn decode(&self, audio: Arc<[u8]>) -> Result<DecodedAudioBuffer, ConversationError> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.decode_and_normalize(&audio))
            .await
            .map_err(|e| {
                ConversationError::AudioDecodeError(format!("decoder task failed: {}", e))
            })?
    }
}

fn timed_out(limit: Duration) -> String {
    format!("timed out after {}s", limit.as_secs())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::tests::{tone, wav_clip};
    use crate::collaborators::CollaboratorError;
    use crate::conversation::session::TurnState;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Language model double: fixed or echoing replies, optional gate, call log.
    pub(crate) struct FakeModel {
        reply: Option<String>,
        fail: bool,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
        pub(crate) calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeModel {
        /// Replies "Hi there" to "Hello", otherwise echoes the utterance.
        pub(crate) fn echo() -> Self {
            Self {
                reply: None,
                fail: false,
                gate: None,
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::echo()
            }
        }

        pub(crate) fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::echo()
            }
        }

        pub(crate) fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::echo()
            }
        }
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        fn name(&self) -> &str {
            "fake-model"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CollaboratorError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(CollaboratorError::Api {
                    status: 500,
                    message: "model exploded".to_string(),
                });
            }
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => {
                    let last = messages.last().map(|m| m.text.clone()).unwrap_or_default();
                    if last == "Hello" {
                        Ok("Hi there".to_string())
                    } else {
                        Ok(format!("re: {}", last))
                    }
                }
            }
        }
    }

    /// Speech synthesis double returning a fixed payload or an error.
    pub(crate) struct FakeSynthesizer {
        audio: Option<Vec<u8>>,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl FakeSynthesizer {
        /// A 44.1 kHz mono WAV clip of `len` samples.
        pub(crate) fn wav(len: usize) -> Self {
            Self {
                audio: Some(wav_clip(44100, 1, tone(44100, len))),
                gate: None,
                delay: None,
            }
        }

        pub(crate) fn bytes(audio: Vec<u8>) -> Self {
            Self {
                audio: Some(audio),
                ..Self::wav(0)
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                audio: None,
                ..Self::wav(0)
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::wav(4410)
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::wav(441)
            }
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        fn name(&self) -> &str {
            "fake-tts"
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice_id: &str,
        ) -> Result<Vec<u8>, CollaboratorError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.audio
                .clone()
                .ok_or_else(|| CollaboratorError::Unavailable("fake-tts".to_string()))
        }
    }

    struct FakeRecognizer {
        transcript: String,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        fn name(&self) -> &str {
            "fake-stt"
        }

        async fn transcribe(&self, _audio: &[u8]) -> Result<String, CollaboratorError> {
            Ok(self.transcript.clone())
        }
    }

    pub(crate) fn test_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            history_limit: 10,
            acknowledgment: "I understand. I'll follow these instructions.".to_string(),
            model_timeout: Duration::from_secs(5),
            synthesis_timeout: Duration::from_secs(5),
            transcription_timeout: Duration::from_secs(5),
        }
    }

    fn coordinator(model: FakeModel, synthesizer: FakeSynthesizer) -> Arc<TurnCoordinator> {
        Arc::new(TurnCoordinator::new(
            Arc::new(SessionStore::new(8)),
            Arc::new(model),
            Arc::new(synthesizer),
            AudioCodecAdapter::default(),
            test_settings(),
        ))
    }

    fn open_session(coordinator: &TurnCoordinator) -> String {
        coordinator.sessions().create("voice-1", "You are a pirate.").unwrap()
    }

    async fn wait_for_state(session: &Session, state: TurnState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never reached {:?}", state);
    }

    #[test]
    fn test_model_history_leads_with_prompt_and_acknowledgment() {
        let prior = vec![Turn::restored("u1", "a1"), Turn::restored("u2", "a2")];
        let messages = build_model_history("prompt", "ack", &prior, 10, "now");

        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0], ChatMessage::user("prompt"));
        assert_eq!(messages[1], ChatMessage::model("ack"));
        assert_eq!(messages[2], ChatMessage::user("u1"));
        assert_eq!(messages[5], ChatMessage::model("a2"));
        assert_eq!(messages[6], ChatMessage::user("now"));
    }

    #[test]
    fn test_model_history_is_bounded() {
        let prior: Vec<Turn> = (0..25)
            .map(|i| Turn::restored(format!("u{}", i), format!("a{}", i)))
            .collect();
        let messages = build_model_history("prompt", "ack", &prior, 10, "now");

        assert_eq!(messages.len(), 2 + 10 * 2 + 1);
        assert_eq!(messages[0].text, "prompt");
        assert_eq!(messages[1].text, "ack");
        assert_eq!(messages[2].text, "u15");
    }

    #[tokio::test]
    async fn test_hello_round_trip_produces_16k_pcm() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::wav(44100));
        let id = open_session(&coordinator);

        let outcome = coordinator.submit_utterance(&id, "Hello").await.unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert_eq!(outcome.user_text, "Hello");
        assert!(outcome.degradation.is_none());
        assert!(outcome.audio.is_some());

        let pcm = outcome.pcm.unwrap();
        assert_eq!(pcm.sample_rate(), 16000);
        assert_eq!(pcm.channels(), 1);
        assert!((pcm.len() as i64 - 16000).abs() <= 1, "got {} samples", pcm.len());

        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::Idle);
        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].assistant_text.as_deref(), Some("Hi there"));
        assert!(history[0].assistant_audio.is_some());
    }

    #[tokio::test]
    async fn test_busy_while_awaiting_model() {
        let gate = Arc::new(Notify::new());
        let coordinator = coordinator(FakeModel::gated(gate.clone()), FakeSynthesizer::wav(4410));
        let id = open_session(&coordinator);

        let pending = coordinator.begin_turn(&id, "Hello").unwrap();
        let runner = coordinator.clone();
        let first = tokio::spawn(async move { runner.run_turn(pending).await });

        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::AwaitingModel);
        let busy = coordinator.begin_turn(&id, "Again").unwrap_err();
        assert_eq!(busy, ConversationError::SessionBusy);

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert_eq!(session.history_len(), 1);
    }

    #[tokio::test]
    async fn test_busy_while_awaiting_speech() {
        let gate = Arc::new(Notify::new());
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::gated(gate.clone()));
        let id = open_session(&coordinator);
        let session = coordinator.sessions().get(&id).unwrap();

        let pending = coordinator.begin_turn(&id, "Hello").unwrap();
        let runner = coordinator.clone();
        let first = tokio::spawn(async move { runner.run_turn(pending).await });

        wait_for_state(&session, TurnState::AwaitingSpeech).await;
        let busy = coordinator.begin_turn(&id, "Again").unwrap_err();
        assert_eq!(busy, ConversationError::SessionBusy);

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert!(outcome.pcm.is_some());
    }

    #[tokio::test]
    async fn test_turns_complete_in_submission_order() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::wav(441));
        let id = open_session(&coordinator);

        let r1 = coordinator.submit_utterance(&id, "first").await.unwrap();
        let r2 = coordinator.submit_utterance(&id, "second").await.unwrap();
        assert_eq!(r1.reply_text, "re: first");
        assert_eq!(r2.reply_text, "re: second");

        let history = coordinator.sessions().get(&id).unwrap().history();
        let users: Vec<&str> = history.iter().map(|t| t.user_text.as_str()).collect();
        assert_eq!(users, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_second_turn_sees_first_in_history() {
        let model = Arc::new(FakeModel::echo());
        let coordinator = TurnCoordinator::new(
            Arc::new(SessionStore::new(2)),
            model.clone(),
            Arc::new(FakeSynthesizer::wav(441)),
            AudioCodecAdapter::default(),
            test_settings(),
        );
        let id = open_session(&coordinator);

        coordinator.submit_utterance(&id, "Hello").await.unwrap();
        coordinator.submit_utterance(&id, "Bye").await.unwrap();

        let calls = model.calls.lock().unwrap();
        let second = &calls[1];
        assert_eq!(second[0], ChatMessage::user("You are a pirate."));
        assert_eq!(second[2], ChatMessage::user("Hello"));
        assert_eq!(second[3], ChatMessage::model("Hi there"));
        assert_eq!(second[4], ChatMessage::user("Bye"));
    }

    #[tokio::test]
    async fn test_model_failure_returns_to_idle_without_history() {
        let coordinator = coordinator(FakeModel::failing(), FakeSynthesizer::wav(441));
        let id = open_session(&coordinator);

        let err = coordinator.submit_utterance(&id, "Hello").await.unwrap_err();
        assert!(matches!(err, ConversationError::ModelError(_)));

        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::Idle);
        assert_eq!(session.history_len(), 0);
        assert!(coordinator.begin_turn(&id, "retry by hand").is_ok());
    }

    #[tokio::test]
    async fn test_model_timeout_is_a_model_error() {
        let coordinator = TurnCoordinator::new(
            Arc::new(SessionStore::new(1)),
            Arc::new(FakeModel::slow(Duration::from_secs(10))),
            Arc::new(FakeSynthesizer::wav(441)),
            AudioCodecAdapter::default(),
            CoordinatorSettings {
                model_timeout: Duration::from_millis(20),
                ..test_settings()
            },
        );
        let id = open_session(&coordinator);

        let err = coordinator.submit_utterance(&id, "Hello").await.unwrap_err();
        assert!(matches!(err, ConversationError::ModelError(ref m) if m.contains("timed out")));
        assert_eq!(coordinator.sessions().get(&id).unwrap().state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_synthesis_timeout_is_a_synthesis_error() {
        let coordinator = TurnCoordinator::new(
            Arc::new(SessionStore::new(1)),
            Arc::new(FakeModel::echo()),
            Arc::new(FakeSynthesizer::slow(Duration::from_secs(10))),
            AudioCodecAdapter::default(),
            CoordinatorSettings {
                synthesis_timeout: Duration::from_millis(20),
                ..test_settings()
            },
        );
        let id = open_session(&coordinator);

        let outcome = coordinator.submit_utterance(&id, "Hello").await.unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert!(outcome.audio.is_none());
        match &outcome.degradation {
            Some(ConversationError::SynthesisError(message)) => {
                assert!(message.contains("timed out"))
            }
            other => panic!("expected a synthesis error, got {:?}", other),
        }

        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::Idle);
        assert_eq!(session.history()[0].state, TurnState::Failed);
    }

    #[tokio::test]
    async fn test_synthesis_failure_still_delivers_text() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::failing());
        let id = open_session(&coordinator);

        let outcome = coordinator.submit_utterance(&id, "Hello").await.unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert!(outcome.audio.is_none());
        assert!(outcome.pcm.is_none());
        assert!(matches!(outcome.degradation, Some(ConversationError::SynthesisError(_))));

        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::Idle);
        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, TurnState::Failed);
        assert_eq!(history[0].assistant_text.as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_reply_and_audio() {
        let synthesizer = FakeSynthesizer::bytes(b"definitely not audio".to_vec());
        let coordinator = coordinator(FakeModel::echo(), synthesizer);
        let id = open_session(&coordinator);

        let outcome = coordinator.submit_utterance(&id, "Hello").await.unwrap();
        assert_eq!(outcome.reply_text, "Hi there");
        assert!(outcome.audio.is_some());
        assert!(outcome.pcm.is_none());
        assert!(matches!(outcome.degradation, Some(ConversationError::AudioDecodeError(_))));
        assert_eq!(coordinator.sessions().get(&id).unwrap().state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_result_discarded_after_destroy() {
        let gate = Arc::new(Notify::new());
        let coordinator = coordinator(FakeModel::gated(gate.clone()), FakeSynthesizer::wav(441));
        let id = open_session(&coordinator);
        let session = coordinator.sessions().get(&id).unwrap();

        let pending = coordinator.begin_turn(&id, "Hello").unwrap();
        let runner = coordinator.clone();
        let turn = tokio::spawn(async move { runner.run_turn(pending).await });

        assert!(coordinator.sessions().destroy(&id));
        assert!(!coordinator.sessions().destroy(&id));
        gate.notify_one();

        let err = turn.await.unwrap().unwrap_err();
        assert!(matches!(err, ConversationError::SessionNotFound(_)));
        assert_eq!(session.history_len(), 0);
        assert_eq!(coordinator.sessions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_utterance_is_rejected() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::wav(441));
        let id = open_session(&coordinator);
        assert!(matches!(
            coordinator.begin_turn(&id, "   ").unwrap_err(),
            ConversationError::InvalidInput(_)
        ));
        assert_eq!(coordinator.sessions().get(&id).unwrap().state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::wav(441));
        let err = coordinator.submit_utterance("missing", "Hello").await.unwrap_err();
        assert_eq!(err, ConversationError::SessionNotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_audio_turn_uses_transcript() {
        let coordinator = TurnCoordinator::new(
            Arc::new(SessionStore::new(1)),
            Arc::new(FakeModel::echo()),
            Arc::new(FakeSynthesizer::wav(441)),
            AudioCodecAdapter::default(),
            test_settings(),
        )
        .with_recognizer(Arc::new(FakeRecognizer {
            transcript: " Hello ".to_string(),
        }));
        let id = open_session(&coordinator);

        let outcome = coordinator.submit_audio(&id, b"webm bytes").await.unwrap();
        assert_eq!(outcome.user_text, "Hello");
        assert_eq!(outcome.reply_text, "Hi there");
        assert_eq!(coordinator.sessions().get(&id).unwrap().history()[0].user_text, "Hello");
    }

    #[tokio::test]
    async fn test_empty_transcript_starts_no_turn() {
        let coordinator = TurnCoordinator::new(
            Arc::new(SessionStore::new(1)),
            Arc::new(FakeModel::echo()),
            Arc::new(FakeSynthesizer::wav(441)),
            AudioCodecAdapter::default(),
            test_settings(),
        )
        .with_recognizer(Arc::new(FakeRecognizer {
            transcript: "  ".to_string(),
        }));
        let id = open_session(&coordinator);

        let err = coordinator.submit_audio(&id, b"silence").await.unwrap_err();
        assert!(matches!(err, ConversationError::TranscriptionError(_)));
        let session = coordinator.sessions().get(&id).unwrap();
        assert_eq!(session.state(), TurnState::Idle);
        assert_eq!(session.history_len(), 0);
    }

    #[tokio::test]
    async fn test_audio_without_recognizer() {
        let coordinator = coordinator(FakeModel::echo(), FakeSynthesizer::wav(441));
        let id = open_session(&coordinator);
        assert!(!coordinator.accepts_audio());
        let err = coordinator.submit_audio(&id, b"audio").await.unwrap_err();
        assert!(matches!(err, ConversationError::TranscriptionError(_)));
    }
}

//! # Conversation Sessions
//!
//! One [`Session`] exists per open WebSocket connection and owns that
//! connection's history and turn state exclusively. The [`SessionStore`] maps
//! session ids to sessions and is the only structure shared across
//! connections.
//!
//! ## Session Lifecycle:
//! 1. **Created**: on connection open, with empty history and state `IDLE`
//! 2. **Turns**: `IDLE -> AWAITING_MODEL -> AWAITING_SPEECH -> DELIVERING -> IDLE`,
//!    with `FAILED` reachable from any busy state and always followed by `IDLE`
//! 3. **Destroyed**: on connection close or explicit `end_session`; idempotent
//!
//! ## Invariants:
//! - at most one turn is in progress per session
//! - history is append-only, and a turn is immutable once appended
//! - the system prompt and voice are fixed at creation

use crate::collaborators::{ChatMessage, Role};
use crate::error::ConversationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use uuid::Uuid;

/// Opaque session identifier, unique for the process lifetime.
pub type SessionId = String;

/// Where a session is in the turn pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Idle,
    AwaitingModel,
    AwaitingSpeech,
    Delivering,
    Failed,
}

impl TurnState {
    /// Whether the pipeline may move from `self` to `next`.
    ///
    /// ## Allowed Transitions:
    /// - IDLE → AWAITING_MODEL (turn accepted)
    /// - AWAITING_MODEL → AWAITING_SPEECH → DELIVERING → IDLE
    /// - any busy state → FAILED → IDLE
    /// - AWAITING_SPEECH → IDLE is not allowed; partial success goes through FAILED
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, AwaitingModel)
                | (AwaitingModel, AwaitingSpeech)
                | (AwaitingSpeech, Delivering)
                | (Delivering, Idle)
                | (AwaitingModel, Failed)
                | (AwaitingSpeech, Failed)
                | (Delivering, Failed)
                | (Failed, Idle)
        )
    }

    pub fn is_idle(self) -> bool {
        self == TurnState::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Idle => "IDLE",
            TurnState::AwaitingModel => "AWAITING_MODEL",
            TurnState::AwaitingSpeech => "AWAITING_SPEECH",
            TurnState::Delivering => "DELIVERING",
            TurnState::Failed => "FAILED",
        }
    }
}

/// One user-utterance / assistant-reply exchange.
///
/// While the turn is in flight `state` mirrors the session state. Once the
/// turn is appended to history it is frozen: `Idle` for a fully delivered turn,
/// `Failed` for one delivered without usable audio.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_text: String,
    pub assistant_text: Option<String>,
    /// Compressed speech as returned by the synthesizer; decoded PCM is never kept
    pub assistant_audio: Option<Arc<[u8]>>,
    pub state: TurnState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Turn {
    fn provisional(user_text: String) -> Self {
        Self {
            user_text,
            assistant_text: None,
            assistant_audio: None,
            state: TurnState::AwaitingModel,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A finished exchange carried over from a previous connection.
    pub fn restored(user_text: impl Into<String>, assistant_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_text: user_text.into(),
            assistant_text: Some(assistant_text.into()),
            assistant_audio: None,
            state: TurnState::Idle,
            started_at: now,
            completed_at: Some(now),
        }
    }
}

/// Pair a browser-style `user`/`model` message list into finished turns.
///
/// A model message without a preceding user message becomes a turn with empty
/// user text; a trailing user message with no reply is dropped.
pub fn turns_from_messages(messages: &[ChatMessage]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut pending_user: Option<&str> = None;

    for message in messages {
        match message.role {
            Role::User => pending_user = Some(message.text.as_str()),
            Role::Model => {
                let user = pending_user.take().unwrap_or_default();
                turns.push(Turn::restored(user, message.text.as_str()));
            }
        }
    }

    turns
}

/// Mutable part of a session, guarded by one short-lived lock.
#[derive(Debug)]
struct SessionInner {
    state: TurnState,
    current: Option<Turn>,
    history: Vec<Turn>,
    closed: bool,
    turns_completed: u64,
    turns_failed: u64,
}

/// Per-connection conversation state.
///
/// ## Thread Safety:
/// Only one turn is ever active, so the mutex is never contended across
/// turns. It exists so the gateway actor and the spawned turn future can both
/// read the state safely.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub voice_id: String,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

/// Point-in-time view of a session for logging and health output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: TurnState,
    pub history_len: usize,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId, voice_id: String, system_prompt: String, history: Vec<Turn>) -> Self {
        Self {
            id,
            voice_id,
            system_prompt,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: TurnState::Idle,
                current: None,
                history,
                closed: false,
                turns_completed: 0,
                turns_failed: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TurnState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the finalized turns, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.lock().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// The last `limit` finalized turns, oldest first.
    pub fn recent_turns(&self, limit: usize) -> Vec<Turn> {
        let inner = self.lock();
        let start = inner.history.len().saturating_sub(limit);
        inner.history[start..].to_vec()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            id: self.id.clone(),
            state: inner.state,
            history_len: inner.history.len(),
            turns_completed: inner.turns_completed,
            turns_failed: inner.turns_failed,
            created_at: self.created_at,
        }
    }

    /// Accept a new turn, or reject it with `SessionBusy`.
    ///
    /// The check and the move to `AWAITING_MODEL` happen under one lock so two
    /// utterances arriving back to back can never both start.
    pub(crate) fn begin_turn(&self, user_text: String) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ConversationError::SessionNotFound(self.id.clone()));
        }
        if !inner.state.is_idle() {
            return Err(ConversationError::SessionBusy);
        }
        inner.state = TurnState::AwaitingModel;
        inner.current = Some(Turn::provisional(user_text));
        Ok(())
    }

    /// Fill in the user text of an audio turn once it has been transcribed.
    pub(crate) fn set_user_text(&self, user_text: &str) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        self.ensure_open(&inner)?;
        if let Some(turn) = inner.current.as_mut() {
            turn.user_text = user_text.to_string();
        }
        Ok(())
    }

    /// Record the model's reply and move to `AWAITING_SPEECH`.
    pub(crate) fn record_reply(&self, reply: &str) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        self.ensure_open(&inner)?;
        Self::transition(&mut inner, TurnState::AwaitingSpeech)?;
        if let Some(turn) = inner.current.as_mut() {
            turn.assistant_text = Some(reply.to_string());
        }
        Ok(())
    }

    /// Record synthesized audio and move to `DELIVERING`.
    pub(crate) fn record_audio(&self, audio: Arc<[u8]>) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        self.ensure_open(&inner)?;
        Self::transition(&mut inner, TurnState::Delivering)?;
        if let Some(turn) = inner.current.as_mut() {
            turn.assistant_audio = Some(audio);
        }
        Ok(())
    }

    /// Move to `FAILED` while keeping the provisional turn (partial delivery follows).
    pub(crate) fn mark_failed(&self) -> Result<(), ConversationError> {
        let mut inner = self.lock();
        self.ensure_open(&inner)?;
        Self::transition(&mut inner, TurnState::Failed)
    }

    /// Append the in-flight turn to history and return to `IDLE`.
    ///
    /// `degraded` marks a turn delivered without usable audio.
    pub(crate) fn finish_turn(&self, degraded: bool) -> Result<Turn, ConversationError> {
        let mut inner = self.lock();
        self.ensure_open(&inner)?;

        let mut turn = inner
            .current
            .take()
            .ok_or_else(|| ConversationError::InvalidInput("no turn in progress".to_string()))?;

        if degraded && inner.state != TurnState::Failed {
            Self::transition(&mut inner, TurnState::Failed)?;
        }
        Self::transition(&mut inner, TurnState::Idle)?;

        turn.state = if degraded { TurnState::Failed } else { TurnState::Idle };
        turn.completed_at = Some(Utc::now());
        inner.history.push(turn.clone());
        if degraded {
            inner.turns_failed += 1;
        } else {
            inner.turns_completed += 1;
        }
        Ok(turn)
    }

    /// Abandon the in-flight turn: `FAILED`, then `IDLE`, nothing appended.
    ///
    /// Safe to call on a closed session or when no turn is running.
    pub(crate) fn abort_turn(&self) {
        let mut inner = self.lock();
        if inner.state.is_idle() {
            return;
        }
        if inner.state != TurnState::Failed {
            inner.state = TurnState::Failed;
        }
        inner.current = None;
        inner.state = TurnState::Idle;
        inner.turns_failed += 1;
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.current = None;
        inner.state = TurnState::Idle;
    }

    fn ensure_open(&self, inner: &SessionInner) -> Result<(), ConversationError> {
        if inner.closed {
            Err(ConversationError::SessionNotFound(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn transition(inner: &mut SessionInner, next: TurnState) -> Result<(), ConversationError> {
        if !inner.state.can_transition_to(next) {
            return Err(ConversationError::InvalidInput(format!(
                "illegal turn transition {} -> {}",
                inner.state.as_str(),
                next.as_str()
            )));
        }
        inner.state = next;
        if let Some(turn) = inner.current.as_mut() {
            turn.state = next;
        }
        Ok(())
    }
}

/// Maps session ids to live sessions.
///
/// ## Thread Safety:
/// `RwLock<HashMap<..>>` lets many connections look sessions up concurrently
/// while creation and removal take a short exclusive lock.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_sessions: AtomicUsize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    /// Create a session with empty history in state `IDLE`.
    pub fn create(
        &self,
        voice_id: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Result<SessionId, ConversationError> {
        self.create_seeded(voice_id, system_prompt, Vec::new())
    }

    /// Create a session whose history starts with turns carried over by a
    /// reconnecting client.
    pub fn create_seeded(
        &self,
        voice_id: impl Into<String>,
        system_prompt: impl Into<String>,
        history: Vec<Turn>,
    ) -> Result<SessionId, ConversationError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let max_sessions = self.max_sessions();
        if sessions.len() >= max_sessions {
            return Err(ConversationError::CapacityExceeded(max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), voice_id.into(), system_prompt.into(), history);
        sessions.insert(id.clone(), Arc::new(session));
        Ok(id)
    }

    /// Look a session up; destroyed and unknown ids fail with `SessionNotFound`.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, ConversationError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ConversationError::SessionNotFound(id.to_string()))
    }

    /// Release a session. Destroying an unknown id is a no-op; returns whether
    /// anything was removed.
    pub fn destroy(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    /// Change the cap. Existing sessions are never evicted.
    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.max_sessions.store(max_sessions, Ordering::Relaxed);
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.iter().map(|s| s.summary()).collect()
    }
}

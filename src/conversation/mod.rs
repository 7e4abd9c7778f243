//! # Conversation Module
//!
//! Turn-taking between the front end and the collaborators.
//!
//! ## Module Organization:
//! - [`session`]: per-connection state and the shared [`SessionStore`]
//! - [`coordinator`]: the `utterance -> model -> speech -> audio` pipeline
//!
//! Nothing here knows about WebSockets; the gateway drives the coordinator and
//! turns its results into wire messages.

pub mod coordinator;
pub mod session;

pub use coordinator::{
    build_model_history, CoordinatorSettings, PendingTurn, TurnCoordinator, TurnOutcome,
};
pub use session::{turns_from_messages, Session, SessionId, SessionStore, Turn, TurnState};

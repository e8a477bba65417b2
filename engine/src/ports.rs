//! Boundary to the host application.
//!
//! The engine never talks to the host directly. Everything it needs (sending
//! prompts, aborting, listing messages and todos, summarizing) goes through
//! [`ConversationApi`], and background-task bookkeeping through
//! [`BackgroundTasks`]. Both are object-safe so the host wires in one `Arc`
//! shared by every component.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use keel_context::StoreError;
use keel_types::{ModelRef, PersistedMessage, PromptRequest, SessionId, Todo};

pub type ApiFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Host-side session metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Set for sub-task sessions spawned by another session.
    pub parent_id: Option<SessionId>,
    pub title: Option<String>,
}

pub trait ConversationApi: Send + Sync {
    fn send_prompt<'a>(&'a self, session_id: &'a SessionId, request: PromptRequest) -> ApiFut<'a, ()>;

    fn abort<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, ()>;

    /// The session transcript, oldest first.
    fn list_messages<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Vec<PersistedMessage>>;

    fn list_todos<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Vec<Todo>>;

    /// Ask the host to compact the session into a summary using `model`.
    fn summarize<'a>(&'a self, session_id: &'a SessionId, model: &'a ModelRef) -> ApiFut<'a, ()>;

    fn get_session<'a>(&'a self, session_id: &'a SessionId) -> ApiFut<'a, Option<SessionInfo>>;
}

pub trait BackgroundTasks: Send + Sync {
    /// Whether any background task spawned by `parent` is still running.
    fn has_running(&self, parent: &SessionId) -> bool;
}

/// For hosts without background tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackgroundTasks;

impl BackgroundTasks for NoBackgroundTasks {
    fn has_running(&self, _parent: &SessionId) -> bool {
        false
    }
}

/// Hook for components that pause while a session is being repaired.
pub trait RecoveryListener: Send + Sync {
    fn mark_recovering(&self, session_id: &SessionId);
    fn mark_recovery_complete(&self, session_id: &SessionId);
}

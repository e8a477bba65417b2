//! Bounded self-loop: re-prompt a session with its original task until it
//! emits a completion marker or runs out of iterations.
//!
//! Only one loop is active at a time. Its state lives in a small JSON file so
//! the host and the CLI can inspect it. The loop only reacts to events from the
//! session that owns it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_context::atomic_write;
use keel_types::{
    BoundedLoopState, HostEvent, PartKind, PersistedMessage, PromptRequest, Role, SessionId,
};

use crate::config::SelfLoopConfig;
use crate::notifications::{Notifier, Toast};
use crate::ports::{ConversationApi, RecoveryListener};

const TOAST_TITLE: &str = "Bounded Loop";

#[derive(Debug, Error)]
pub enum LoopStateError {
    #[error("failed to read loop state {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write loop state {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed loop state {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("a loop is already active for session {0}")]
    AlreadyActive(SessionId),
}

/// The loop state file.
#[derive(Debug, Clone)]
pub struct LoopStateFile {
    path: PathBuf,
}

impl LoopStateFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<BoundedLoopState>, LoopStateError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LoopStateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| LoopStateError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, state: &BoundedLoopState) -> Result<(), LoopStateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| LoopStateError::Parse {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, &bytes).map_err(|source| LoopStateError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Remove the file. Returns `false` if there was nothing to remove.
    pub fn clear(&self) -> Result<bool, LoopStateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LoopStateError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[must_use]
pub fn loop_prompt(state: &BoundedLoopState) -> String {
    format!(
        "[SYSTEM DIRECTIVE - BOUNDED LOOP {iteration}/{max}]

Your previous attempt did not output the completion promise. Continue working on the task.

IMPORTANT:
- Review your progress so far
- Continue from where you left off
- When FULLY complete, output: <promise>{promise}</promise>
- Do not stop until the task is truly done

Original task:
{prompt}",
        iteration = state.iteration,
        max = state.max_iterations,
        promise = state.completion_promise,
        prompt = state.prompt,
    )
}

/// Whether the assistant output of the latest turn contains
/// `<promise>PROMISE</promise>`, ignoring case and surrounding whitespace.
#[must_use]
pub fn contains_completion(messages: &[PersistedMessage], promise: &str) -> bool {
    let pattern = format!(r"(?is)<promise>\s*{}\s*</promise>", regex::escape(promise));
    let Ok(marker) = Regex::new(&pattern) else {
        return false;
    };

    let turn_start = messages
        .iter()
        .rposition(|message| message.info.role == Role::User)
        .map_or(0, |index| index + 1);
    messages[turn_start..]
        .iter()
        .filter(|message| message.is_assistant())
        .flat_map(|message| message.parts.iter())
        .any(|part| matches!(&part.kind, PartKind::Text { text, .. } if marker.is_match(text)))
}

#[derive(Debug, Clone, Copy)]
enum Recovering {
    /// Paused until recovery reports completion.
    UntilComplete,
    /// Paused after an error until the deadline passes.
    Until(Instant),
}

pub struct SelfLoop {
    api: Arc<dyn ConversationApi>,
    notifier: Arc<dyn Notifier>,
    file: LoopStateFile,
    config: SelfLoopConfig,
    recovering: Mutex<HashMap<SessionId, Recovering>>,
    /// Sessions with an iteration between its first and last await.
    in_flight: Mutex<HashSet<SessionId>>,
}

impl SelfLoop {
    #[must_use]
    pub fn new(
        api: Arc<dyn ConversationApi>,
        notifier: Arc<dyn Notifier>,
        file: LoopStateFile,
        config: SelfLoopConfig,
    ) -> Self {
        Self {
            api,
            notifier,
            file,
            config,
            recovering: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Start a loop owned by `session_id`. Fails if another session owns an
    /// active loop; restarting the owner's loop replaces it.
    pub fn start(
        &self,
        session_id: &SessionId,
        prompt: impl Into<String>,
        max_iterations: Option<u32>,
        completion_promise: Option<String>,
    ) -> Result<BoundedLoopState, LoopStateError> {
        if let Some(existing) = self.file.load()?
            && existing.active
            && !existing.is_owned_by(session_id)
        {
            return Err(LoopStateError::AlreadyActive(existing.session_id));
        }

        let state = BoundedLoopState {
            active: true,
            iteration: 1,
            max_iterations: max_iterations
                .unwrap_or(self.config.default_max_iterations)
                .max(1),
            completion_promise: completion_promise
                .filter(|promise| !promise.trim().is_empty())
                .unwrap_or_else(|| self.config.default_completion_promise.clone()),
            started_at: chrono::Utc::now().to_rfc3339(),
            prompt: prompt.into(),
            session_id: session_id.clone(),
        };
        self.file.save(&state)?;
        info!(session = %session_id, max_iterations = state.max_iterations, "Bounded loop started");
        Ok(state)
    }

    /// Cancel the loop. Only its owner can; returns whether a loop was cleared.
    pub fn cancel(&self, session_id: &SessionId) -> Result<bool, LoopStateError> {
        match self.file.load()? {
            Some(state) if state.is_owned_by(session_id) => {
                self.file.clear()?;
                info!(session = %session_id, iteration = state.iteration, "Bounded loop cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The active loop, if any. An unreadable state file counts as none.
    #[must_use]
    pub fn state(&self) -> Option<BoundedLoopState> {
        match self.file.load() {
            Ok(state) => state.filter(|state| state.active),
            Err(err) => {
                warn!("Failed to load loop state: {err}");
                None
            }
        }
    }

    pub fn mark_recovering(&self, session_id: &SessionId) {
        self.lock_recovering()
            .insert(session_id.clone(), Recovering::UntilComplete);
    }

    pub fn mark_recovery_complete(&self, session_id: &SessionId) {
        self.lock_recovering().remove(session_id);
    }

    pub async fn handle_event(&self, event: &HostEvent) {
        if !self.config.enabled {
            return;
        }
        match event {
            HostEvent::SessionIdle { session_id } => self.on_idle(session_id).await,
            HostEvent::SessionError { session_id, .. } => {
                if self.owned_by(session_id) {
                    let until = Instant::now() + self.config.error_recovery();
                    self.lock_recovering()
                        .insert(session_id.clone(), Recovering::Until(until));
                    debug!(session = %session_id, "Bounded loop paused after error");
                }
            }
            HostEvent::SessionDeleted { session_id } => {
                self.lock_recovering().remove(session_id);
                if self.owned_by(session_id) {
                    self.clear("owner session deleted");
                }
            }
            _ => {}
        }
    }

    async fn on_idle(&self, session_id: &SessionId) {
        let Some(state) = self.state().filter(|state| state.is_owned_by(session_id)) else {
            return;
        };
        if self.is_recovering(session_id) {
            debug!(session = %session_id, "Bounded loop waiting for recovery");
            return;
        }
        if !self.lock_in_flight().insert(session_id.clone()) {
            debug!(session = %session_id, "Bounded loop iteration already running");
            return;
        }
        self.run_iteration(session_id, state).await;
        self.lock_in_flight().remove(session_id);
    }

    /// Whether `state` is still the live loop and nothing paused it.
    fn unchanged(&self, session_id: &SessionId, state: &BoundedLoopState) -> bool {
        self.state().as_ref() == Some(state) && !self.is_recovering(session_id)
    }

    async fn run_iteration(&self, session_id: &SessionId, state: BoundedLoopState) {
        let messages = match self.api.list_messages(session_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(session = %session_id, "Failed to list messages: {err}");
                return;
            }
        };
        if !self.unchanged(session_id, &state) {
            return;
        }
        if contains_completion(&messages, &state.completion_promise) {
            self.clear("completion promise found");
            self.notifier.toast(Toast::success(
                TOAST_TITLE,
                format!("Task completed after {} iteration(s)", state.iteration),
            ));
            return;
        }
        if state.iteration > state.max_iterations {
            self.clear("iteration count past maximum");
            return;
        }

        let request = PromptRequest::text(loop_prompt(&state));
        if let Err(err) = self.api.send_prompt(session_id, request).await {
            warn!(session = %session_id, iteration = state.iteration, "Failed to send loop prompt: {err}");
            return;
        }
        info!(session = %session_id, iteration = state.iteration, max = state.max_iterations, "Bounded loop continued");

        // The owner may have cancelled or restarted the loop while we awaited.
        if self.state().as_ref() != Some(&state) {
            return;
        }
        if state.iteration >= state.max_iterations {
            self.clear("max iterations reached");
            self.notifier.toast(Toast::warning(
                TOAST_TITLE,
                format!("Stopped after {} iterations without completion", state.max_iterations),
            ));
            return;
        }

        let next = BoundedLoopState {
            iteration: state.iteration + 1,
            ..state
        };
        if let Err(err) = self.file.save(&next) {
            warn!(session = %session_id, "Failed to persist loop state: {err}");
        }
    }

    fn owned_by(&self, session_id: &SessionId) -> bool {
        self.state()
            .is_some_and(|state| state.is_owned_by(session_id))
    }

    fn is_recovering(&self, session_id: &SessionId) -> bool {
        let mut recovering = self.lock_recovering();
        match recovering.get(session_id) {
            Some(Recovering::UntilComplete) => true,
            Some(Recovering::Until(deadline)) if Instant::now() < *deadline => true,
            Some(Recovering::Until(_)) => {
                recovering.remove(session_id);
                false
            }
            None => false,
        }
    }

    fn clear(&self, reason: &str) {
        match self.file.clear() {
            Ok(_) => info!(reason, "Bounded loop cleared"),
            Err(err) => warn!(reason, "Failed to clear loop state: {err}"),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recovering(&self) -> MutexGuard<'_, HashMap<SessionId, Recovering>> {
        self.recovering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecoveryListener for SelfLoop {
    fn mark_recovering(&self, session_id: &SessionId) {
        SelfLoop::mark_recovering(self, session_id);
    }

    fn mark_recovery_complete(&self, session_id: &SessionId) {
        SelfLoop::mark_recovery_complete(self, session_id);
    }
}

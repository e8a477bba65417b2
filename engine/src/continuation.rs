//! Idle nudge: keep a session working while its todo list has open items.
//!
//! When a tracked session goes idle with incomplete todos, a short countdown
//! starts. Activity on the session (assistant output, tool execution, a user
//! message after the grace window, deletion) cancels it. When it expires the
//! conditions are checked again and a single continuation prompt is sent.
//!
//! Each countdown carries the version it was started under. Cancelling or
//! restarting bumps the version, and a countdown that wakes up under a stale
//! version exits without doing anything. Countdown tasks are never aborted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use keel_types::{
    HostEvent, MessageInfo, PromptRequest, Role, SessionId, TodoProgress, is_abort_error,
};

use crate::config::ContinuationConfig;
use crate::notifications::{Notifier, Toast};
use crate::ports::{BackgroundTasks, ConversationApi, RecoveryListener};
use crate::session_table::SessionTable;

pub const CONTINUATION_PROMPT: &str = "[SYSTEM REMINDER - TODO CONTINUATION]

Incomplete tasks remain in your todo list. Continue working on the next pending task.

- Proceed without asking for permission
- Mark each task complete when finished
- Do not stop until all tasks are done";

const TOAST_TITLE: &str = "Todo Continuation";

#[must_use]
pub fn continuation_prompt(progress: TodoProgress) -> String {
    format!(
        "{CONTINUATION_PROMPT}\n\n[Status: {}/{} completed, {} remaining]",
        progress.completed, progress.total, progress.remaining
    )
}

#[derive(Debug, Default)]
struct TimerState {
    version: u64,
    scheduled: bool,
    countdown_started: Option<Instant>,
    recovering: bool,
    /// The last event for this session was an abort error.
    abort_pending: bool,
}

impl TimerState {
    fn cancel(&mut self) {
        if self.scheduled {
            self.version += 1;
            self.scheduled = false;
            self.countdown_started = None;
        }
    }
}

pub struct IdleNudge {
    inner: Arc<NudgeInner>,
}

struct NudgeInner {
    api: Arc<dyn ConversationApi>,
    notifier: Arc<dyn Notifier>,
    tasks: Arc<dyn BackgroundTasks>,
    config: ContinuationConfig,
    sessions: SessionTable<TimerState>,
    primary: Mutex<Option<SessionId>>,
    subagents: Mutex<HashSet<SessionId>>,
}

impl IdleNudge {
    #[must_use]
    pub fn new(
        api: Arc<dyn ConversationApi>,
        notifier: Arc<dyn Notifier>,
        tasks: Arc<dyn BackgroundTasks>,
        config: ContinuationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(NudgeInner {
                api,
                notifier,
                tasks,
                config,
                sessions: SessionTable::new(),
                primary: Mutex::new(None),
                subagents: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Restrict nudging to this session and registered sub-task sessions.
    /// With no primary session every session is eligible.
    pub fn set_primary_session(&self, session_id: Option<SessionId>) {
        *self
            .inner
            .primary
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    pub fn register_subagent(&self, session_id: SessionId) {
        self.inner
            .subagents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
    }

    pub fn unregister_subagent(&self, session_id: &SessionId) {
        self.inner
            .subagents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    pub fn mark_recovering(&self, session_id: &SessionId) {
        self.inner.sessions.entry(session_id, |state| {
            state.recovering = true;
            state.cancel();
        });
    }

    pub fn mark_recovery_complete(&self, session_id: &SessionId) {
        self.inner.sessions.with(session_id, |state| {
            if let Some(state) = state {
                state.recovering = false;
            }
        });
    }

    #[must_use]
    pub fn is_scheduled(&self, session_id: &SessionId) -> bool {
        self.inner
            .sessions
            .with(session_id, |state| state.is_some_and(|s| s.scheduled))
    }

    pub async fn handle_event(&self, event: &HostEvent) {
        if !self.inner.config.enabled {
            return;
        }
        match event {
            HostEvent::SessionError { session_id, error } => {
                let aborted = error.as_ref().is_some_and(is_abort_error);
                self.inner.sessions.entry(session_id, |state| {
                    state.cancel();
                    state.abort_pending = aborted;
                });
            }
            HostEvent::SessionIdle { session_id } => self.on_idle(session_id).await,
            HostEvent::MessageUpdated { info } => {
                let grace = self.inner.config.grace();
                self.inner.sessions.with(&info.session_id, |state| {
                    let Some(state) = state else {
                        return;
                    };
                    state.abort_pending = false;
                    let past_grace = state
                        .countdown_started
                        .is_some_and(|started| started.elapsed() >= grace);
                    if info.role == Role::Assistant || past_grace {
                        state.cancel();
                    }
                });
            }
            HostEvent::MessagePartUpdated {
                session_id, role, ..
            } => {
                self.inner.sessions.with(session_id, |state| {
                    if let Some(state) = state {
                        state.abort_pending = false;
                        if *role == Some(Role::Assistant) {
                            state.cancel();
                        }
                    }
                });
            }
            HostEvent::ToolExecuteBefore { session_id, .. }
            | HostEvent::ToolExecuteAfter { session_id, .. } => {
                self.inner.sessions.with(session_id, |state| {
                    if let Some(state) = state {
                        state.abort_pending = false;
                        state.cancel();
                    }
                });
            }
            HostEvent::SessionDeleted { session_id } => {
                self.inner.sessions.remove(session_id);
                self.unregister_subagent(session_id);
            }
        }
    }

    async fn on_idle(&self, session_id: &SessionId) {
        let inner = &self.inner;
        let (skip_abort, version) = inner.sessions.entry(session_id, |state| {
            (std::mem::take(&mut state.abort_pending), state.version)
        });
        if skip_abort {
            debug!(session = %session_id, "Idle after abort, not continuing");
            return;
        }
        if !inner.is_tracked(session_id) || inner.is_recovering(session_id) {
            return;
        }
        if inner.tasks.has_running(session_id) {
            debug!(session = %session_id, "Background tasks running, not continuing");
            return;
        }

        let progress = match inner.api.list_todos(session_id).await {
            Ok(todos) => TodoProgress::of(&todos),
            Err(err) => {
                warn!(session = %session_id, "Failed to list todos: {err}");
                return;
            }
        };
        if !progress.has_incomplete() {
            return;
        }

        let started = inner.sessions.with(session_id, |state| {
            let state = state?;
            if state.version != version || state.recovering {
                return None;
            }
            state.version += 1;
            state.scheduled = true;
            state.countdown_started = Some(Instant::now());
            Some(state.version)
        });
        let Some(version) = started else {
            return;
        };

        debug!(session = %session_id, version, remaining = progress.remaining, "Continuation countdown started");
        tokio::spawn(run_countdown(
            Arc::clone(inner),
            session_id.clone(),
            version,
            progress.remaining,
        ));
    }
}

impl RecoveryListener for IdleNudge {
    fn mark_recovering(&self, session_id: &SessionId) {
        IdleNudge::mark_recovering(self, session_id);
    }

    fn mark_recovery_complete(&self, session_id: &SessionId) {
        IdleNudge::mark_recovery_complete(self, session_id);
    }
}

async fn run_countdown(inner: Arc<NudgeInner>, session_id: SessionId, version: u64, remaining: usize) {
    let mut left = inner.config.countdown();
    while !left.is_zero() {
        if !inner.is_current(&session_id, version) {
            return;
        }
        let secs = left.as_millis().div_ceil(1000);
        inner.notifier.toast(
            Toast::info(
                TOAST_TITLE,
                format!("Resuming in {secs}s... ({remaining} tasks remaining)"),
            )
            .with_duration(Duration::from_secs(1)),
        );
        let step = left.min(Duration::from_secs(1));
        tokio::time::sleep(step).await;
        left = left.saturating_sub(step);
    }

    if inner.is_current(&session_id, version) {
        inner.fire(&session_id, version).await;
    }
}

impl NudgeInner {
    fn is_tracked(&self, session_id: &SessionId) -> bool {
        let primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
        match primary.as_ref() {
            None => true,
            Some(primary) if primary == session_id => true,
            Some(_) => self
                .subagents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(session_id),
        }
    }

    fn is_recovering(&self, session_id: &SessionId) -> bool {
        self.sessions
            .with(session_id, |state| state.is_some_and(|s| s.recovering))
    }

    fn is_current(&self, session_id: &SessionId, version: u64) -> bool {
        self.sessions.with(session_id, |state| {
            state.is_some_and(|s| s.version == version && !s.recovering)
        })
    }

    async fn fire(&self, session_id: &SessionId, version: u64) {
        self.sessions.with(session_id, |state| {
            if let Some(state) = state
                && state.version == version
            {
                state.scheduled = false;
                state.countdown_started = None;
            }
        });

        let progress = match self.api.list_todos(session_id).await {
            Ok(todos) => TodoProgress::of(&todos),
            Err(err) => {
                warn!(session = %session_id, "Failed to list todos: {err}");
                return;
            }
        };
        if !progress.has_incomplete() {
            debug!(session = %session_id, "Todos finished during countdown");
            return;
        }

        let messages = match self.api.list_messages(session_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(session = %session_id, "Failed to list messages: {err}");
                return;
            }
        };
        let previous: Option<&MessageInfo> = messages
            .iter()
            .rev()
            .map(|message| &message.info)
            .find(|info| info.agent.is_some());
        if let Some(info) = previous {
            if let Some(agent) = &info.agent
                && self.config.skip_agents.iter().any(|skip| skip == agent)
            {
                debug!(session = %session_id, agent, "Planning agent, not continuing");
                return;
            }
            if !info.allows_writes() {
                debug!(session = %session_id, "Write permission revoked, not continuing");
                return;
            }
        }

        if !self.is_current(session_id, version) {
            return;
        }

        let request = PromptRequest::text(continuation_prompt(progress))
            .with_agent(previous.and_then(|info| info.agent.clone()))
            .with_model(previous.and_then(MessageInfo::model));
        match self.api.send_prompt(session_id, request).await {
            Ok(()) => info!(
                session = %session_id,
                remaining = progress.remaining,
                "Sent todo continuation"
            ),
            Err(err) => warn!(session = %session_id, "Failed to send continuation: {err}"),
        }
    }
}

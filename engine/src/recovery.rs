//! Structural session repair.
//!
//! Some provider rejections are not about size but about transcript shape: a
//! tool call without its result, a turn whose thinking block is out of place,
//! or thinking content sent to a model with thinking disabled. These are
//! repaired in place, after aborting the session so nothing races the edits.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use keel_context::{TranscriptStore, detect_structural_error, find_orphaned_tool_uses};
use keel_types::{
    HostEvent, MessageId, ParsedRecoveryError, PromptPart, PromptRequest, RecoveryErrorKind, Role,
    SessionId,
};

use crate::compaction::RESUME_PROMPT;
use crate::config::RecoveryConfig;
use crate::notifications::{Notifier, Toast};
use crate::ports::{ConversationApi, RecoveryListener};
use crate::session_table::SessionTable;

pub const CANCELLED_TOOL_RESULT: &str = "Operation cancelled by user (ESC pressed)";

const TOAST_TITLE: &str = "Session Recovery";

fn describe(kind: RecoveryErrorKind) -> &'static str {
    match kind {
        RecoveryErrorKind::ToolResultMissing => "missing tool results",
        RecoveryErrorKind::ThinkingBlockOrder => "thinking block order",
        RecoveryErrorKind::ThinkingDisabledViolation => "thinking on a non-thinking model",
        _ => "transcript error",
    }
}

pub struct SessionRecovery {
    api: Arc<dyn ConversationApi>,
    notifier: Arc<dyn Notifier>,
    store: Arc<TranscriptStore>,
    config: RecoveryConfig,
    listeners: Vec<Arc<dyn RecoveryListener>>,
    in_flight: SessionTable<HashSet<MessageId>>,
}

impl SessionRecovery {
    #[must_use]
    pub fn new(
        api: Arc<dyn ConversationApi>,
        notifier: Arc<dyn Notifier>,
        store: Arc<TranscriptStore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            api,
            notifier,
            store,
            config,
            listeners: Vec::new(),
            in_flight: SessionTable::new(),
        }
    }

    /// Components to pause while a repair runs.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RecoveryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub async fn handle_event(&self, event: &HostEvent) {
        if !self.config.enabled {
            return;
        }
        match event {
            HostEvent::SessionError {
                session_id,
                error: Some(error),
            } => {
                let failed = match self.store.last_assistant(session_id) {
                    Ok(message) => message.map(|message| message.info.id),
                    Err(err) => {
                        warn!(session = %session_id, "Failed to find failed message: {err}");
                        None
                    }
                };
                if let Some(message_id) = failed {
                    self.recover(session_id, &message_id, error).await;
                }
            }
            HostEvent::MessageUpdated { info } if info.role == Role::Assistant => {
                if let Some(error) = &info.error {
                    self.recover(&info.session_id, &info.id, error).await;
                }
            }
            HostEvent::SessionDeleted { session_id } => {
                self.in_flight.remove(session_id);
            }
            _ => {}
        }
    }

    /// Repair the session if `error` is a structural rejection of
    /// `message_id`. Returns whether a repair was applied.
    pub async fn recover(&self, session_id: &SessionId, message_id: &MessageId, error: &Value) -> bool {
        let Some(parsed) = detect_structural_error(error) else {
            return false;
        };
        let claimed = self
            .in_flight
            .entry(session_id, |messages| messages.insert(message_id.clone()));
        if !claimed {
            debug!(session = %session_id, message = %message_id, "Recovery already running");
            return false;
        }

        for listener in &self.listeners {
            listener.mark_recovering(session_id);
        }
        let repaired = self.run(session_id, message_id, &parsed).await;
        for listener in &self.listeners {
            listener.mark_recovery_complete(session_id);
        }
        self.in_flight.with(session_id, |messages| {
            if let Some(messages) = messages {
                messages.remove(message_id);
            }
        });
        repaired
    }

    async fn run(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        parsed: &ParsedRecoveryError,
    ) -> bool {
        info!(session = %session_id, message = %message_id, kind = %parsed.kind, "Recovering session");
        if let Err(err) = self.api.abort(session_id).await {
            warn!(session = %session_id, "Failed to abort before recovery: {err}");
        }
        self.notifier.toast(Toast::info(
            TOAST_TITLE,
            format!("Fixing {}...", describe(parsed.kind)),
        ));

        let repaired = match parsed.kind {
            RecoveryErrorKind::ToolResultMissing => {
                self.answer_orphaned_tools(session_id, message_id).await
            }
            RecoveryErrorKind::ThinkingBlockOrder => {
                self.reorder_thinking(session_id, parsed.message_index)
            }
            RecoveryErrorKind::ThinkingDisabledViolation => self.strip_thinking(session_id),
            _ => false,
        };

        if !repaired {
            warn!(session = %session_id, kind = %parsed.kind, "Recovery found nothing to repair");
            self.notifier.toast(Toast::error(
                TOAST_TITLE,
                format!("Could not repair {}", describe(parsed.kind)),
            ));
            return false;
        }

        // Answering tool calls already restarts the turn.
        if self.config.auto_resume && parsed.kind != RecoveryErrorKind::ToolResultMissing {
            let request = PromptRequest::text(RESUME_PROMPT);
            if let Err(err) = self.api.send_prompt(session_id, request).await {
                warn!(session = %session_id, "Failed to resume after recovery: {err}");
            }
        }
        self.notifier.toast(Toast::success(
            TOAST_TITLE,
            format!("Repaired {}", describe(parsed.kind)),
        ));
        true
    }

    async fn answer_orphaned_tools(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        let messages = match self.store.list_messages(session_id) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(session = %session_id, "Failed to load transcript: {err}");
                return false;
            }
        };
        let Some(failed) = messages.iter().find(|message| &message.info.id == message_id) else {
            return false;
        };
        let orphans = find_orphaned_tool_uses(failed, &messages);
        if orphans.is_empty() {
            return false;
        }

        let count = orphans.len();
        let request = PromptRequest {
            parts: orphans
                .into_iter()
                .map(|tool_use_id| PromptPart::ToolResult {
                    tool_use_id,
                    content: CANCELLED_TOOL_RESULT.to_string(),
                })
                .collect(),
            agent: failed.info.agent.clone(),
            model: failed.info.model(),
        };
        match self.api.send_prompt(session_id, request).await {
            Ok(()) => {
                debug!(session = %session_id, count, "Answered orphaned tool calls");
                true
            }
            Err(err) => {
                warn!(session = %session_id, "Failed to send cancelled tool results: {err}");
                false
            }
        }
    }

    fn reorder_thinking(&self, session_id: &SessionId, index: Option<usize>) -> bool {
        let indexed = index.and_then(|index| match self.store.find_message_by_index(session_id, index) {
            Ok(message) => message.filter(|message| message.is_assistant()),
            Err(err) => {
                warn!(session = %session_id, "Failed to load indexed message: {err}");
                None
            }
        });
        if let Some(message) = indexed
            && self.store.prepend_thinking_part(session_id, &message.info.id)
        {
            return true;
        }

        match self.store.find_messages_with_orphan_thinking(session_id) {
            Ok(ids) => ids.iter().fold(false, |repaired, id| {
                self.store.prepend_thinking_part(session_id, id) | repaired
            }),
            Err(err) => {
                warn!(session = %session_id, "Failed to scan for misplaced thinking: {err}");
                false
            }
        }
    }

    fn strip_thinking(&self, session_id: &SessionId) -> bool {
        match self.store.find_messages_with_thinking_blocks(session_id) {
            Ok(ids) => ids.iter().fold(false, |repaired, id| {
                self.store.strip_thinking_parts(session_id, id) | repaired
            }),
            Err(err) => {
                warn!(session = %session_id, "Failed to scan for thinking parts: {err}");
                false
            }
        }
    }
}

//! Context-overflow recovery.
//!
//! A classified token-limit error marks the session `Pending`. The next idle
//! event for that session runs the recovery procedure, cheapest step first:
//!
//! 1. Empty-content violations: repair the offending messages and resume.
//! 2. Optionally commit a pruning pass and truncate what it marked.
//! 3. Truncate oversized tool outputs; resume if that frees enough.
//! 4. Summarize with the session model, retrying with exponential backoff.
//! 5. Summarize with each configured fallback model.
//!
//! At most one procedure runs per session. Errors that arrive while one is
//! running are queued for the next idle cycle. Listeners are marked recovering
//! from the moment an error is classified until the procedure finishes, so the
//! continuation schedulers stay quiet meanwhile. Every suspension point is
//! followed by a state re-check, so a session deleted mid-procedure is simply
//! dropped.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use keel_context::{
    ErrorClassifier, PLACEHOLDER_TEXT, PruningMode, TranscriptStore, TruncationTarget,
};
use keel_types::{
    HostEvent, ModelRef, ParsedRecoveryError, PromptRequest, RecoveryErrorKind, Role, SessionId,
};

use crate::config::CompactionConfig;
use crate::notifications::{Notifier, Toast};
use crate::ports::{ConversationApi, RecoveryListener};
use crate::pruning::PruningService;
use crate::session_table::SessionTable;

/// Prompt sent to pick the conversation back up after a repair.
pub const RESUME_PROMPT: &str = "Continue";

const TOAST_TITLE: &str = "Context Recovery";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompactionPhase {
    #[default]
    Idle,
    Pending,
    Compacting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Nothing ran: another procedure was active, the session was already
    /// summarized, or it went away mid-procedure.
    Skipped,
    Repaired { messages: usize },
    Truncated { parts: usize, freed_chars: usize },
    Summarized { model: ModelRef },
    Exhausted,
}

/// Read-only view of a session's compaction bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSnapshot {
    pub phase: CompactionPhase,
    /// Summarize calls made across the whole fallback chain.
    pub retry_count: u32,
    /// Position in the model chain of the latest summarize attempt.
    pub fallback_index: usize,
    /// Tool outputs truncated so far.
    pub truncation_attempts: usize,
}

#[derive(Debug, Clone, Default)]
struct CompactionState {
    phase: CompactionPhase,
    last_error: Option<ParsedRecoveryError>,
    /// Classified while a procedure was running; handled next cycle.
    queued_error: Option<ParsedRecoveryError>,
    retry_count: u32,
    fallback_index: usize,
    truncation_attempts: usize,
}

pub struct CompactionOrchestrator {
    api: Arc<dyn ConversationApi>,
    notifier: Arc<dyn Notifier>,
    store: Arc<TranscriptStore>,
    classifier: ErrorClassifier,
    pruning: Option<Arc<PruningService>>,
    listeners: Vec<Arc<dyn RecoveryListener>>,
    config: CompactionConfig,
    states: SessionTable<CompactionState>,
}

impl CompactionOrchestrator {
    #[must_use]
    pub fn new(
        api: Arc<dyn ConversationApi>,
        notifier: Arc<dyn Notifier>,
        store: Arc<TranscriptStore>,
        classifier: ErrorClassifier,
        config: CompactionConfig,
    ) -> Self {
        Self {
            api,
            notifier,
            store,
            classifier,
            pruning: None,
            listeners: Vec::new(),
            config,
            states: SessionTable::new(),
        }
    }

    /// Enables the pre-compaction pruning pass when `prune_first` is set.
    #[must_use]
    pub fn with_pruning(mut self, pruning: Arc<PruningService>) -> Self {
        self.pruning = Some(pruning);
        self
    }

    /// Components to pause while compaction is pending or running.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RecoveryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn phase(&self, session_id: &SessionId) -> CompactionPhase {
        self.snapshot(session_id).phase
    }

    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> CompactionSnapshot {
        self.states
            .with(session_id, |state| {
                state.map(|s| CompactionSnapshot {
                    phase: s.phase,
                    retry_count: s.retry_count,
                    fallback_index: s.fallback_index,
                    truncation_attempts: s.truncation_attempts,
                })
            })
            .unwrap_or_default()
    }

    /// The error that will drive the next procedure.
    #[must_use]
    pub fn pending_error(&self, session_id: &SessionId) -> Option<ParsedRecoveryError> {
        self.states
            .with(session_id, |state| state.and_then(|s| s.last_error.clone()))
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
                self.record_error(session_id, error, None);
            }
            HostEvent::MessageUpdated { info } if info.role == Role::Assistant => {
                if let Some(error) = &info.error {
                    self.record_error(&info.session_id, error, info.model().as_ref());
                }
            }
            HostEvent::SessionIdle { session_id } => {
                if self.phase(session_id) == CompactionPhase::Pending {
                    self.run_pending(session_id).await;
                }
            }
            HostEvent::SessionDeleted { session_id } => {
                if self.states.remove(session_id).is_some() {
                    debug!(session = %session_id, "Dropped compaction state");
                }
            }
            _ => {}
        }
    }

    /// Classify `raw` and, if it is a token-limit error, schedule compaction.
    pub fn record_error(&self, session_id: &SessionId, raw: &Value, model: Option<&ModelRef>) -> bool {
        let model = model.cloned().or_else(|| self.session_model(session_id));
        let parsed = self.classifier.classify(
            raw,
            model.as_ref().map(|m| m.provider_id.as_str()),
            model.as_ref().map(|m| m.model_id.as_str()),
        );
        let Some(parsed) = parsed else {
            return false;
        };

        info!(
            session = %session_id,
            kind = %parsed.kind,
            current_tokens = ?parsed.current_tokens,
            max_tokens = ?parsed.max_tokens,
            "Context limit error classified"
        );
        self.states.entry(session_id, |state| {
            if state.phase == CompactionPhase::Compacting {
                state.queued_error = Some(parsed);
            } else {
                state.phase = CompactionPhase::Pending;
                state.last_error = Some(parsed);
            }
        });
        self.mark_recovering(session_id);
        true
    }

    /// Run the procedure now. A no-op while one is already running.
    pub async fn execute_compaction(
        &self,
        session_id: &SessionId,
        model_hint: Option<ModelRef>,
    ) -> CompactionOutcome {
        let started = self.states.entry(session_id, |state| {
            if state.phase == CompactionPhase::Compacting {
                return false;
            }
            state.phase = CompactionPhase::Compacting;
            true
        });
        if !started {
            debug!(session = %session_id, "Compaction already running");
            return CompactionOutcome::Skipped;
        }
        self.mark_recovering(session_id);
        self.compact(session_id, model_hint).await
    }

    async fn run_pending(&self, session_id: &SessionId) -> CompactionOutcome {
        match self.api.list_messages(session_id).await {
            Ok(messages) => {
                let summarized = messages
                    .iter()
                    .rev()
                    .find(|message| message.is_assistant())
                    .is_some_and(|message| message.info.summary);
                if summarized {
                    debug!(session = %session_id, "Session already summarized, clearing");
                    self.states.remove(session_id);
                    self.release(session_id);
                    return CompactionOutcome::Skipped;
                }
            }
            Err(err) => warn!(session = %session_id, "Failed to list messages: {err}"),
        }

        let started = self.states.with(session_id, |state| match state {
            Some(state) if state.phase == CompactionPhase::Pending => {
                state.phase = CompactionPhase::Compacting;
                true
            }
            _ => false,
        });
        if !started {
            return CompactionOutcome::Skipped;
        }
        self.mark_recovering(session_id);
        self.compact(session_id, None).await
    }

    async fn compact(&self, session_id: &SessionId, model_hint: Option<ModelRef>) -> CompactionOutcome {
        tokio::time::sleep(self.config.debounce()).await;
        let Some(state) = self
            .states
            .get(session_id)
            .filter(|state| state.phase == CompactionPhase::Compacting)
        else {
            self.release(session_id);
            return CompactionOutcome::Skipped;
        };

        let outcome = self.run_procedure(session_id, &state, model_hint).await;
        self.finish(session_id, &outcome);
        outcome
    }

    async fn run_procedure(
        &self,
        session_id: &SessionId,
        state: &CompactionState,
        model_hint: Option<ModelRef>,
    ) -> CompactionOutcome {
        let error = state.last_error.as_ref();

        if let Some(error) = error
            && error.kind == RecoveryErrorKind::NonEmptyContentViolation
        {
            let repaired = self.repair_empty_messages(session_id, error.message_index);
            if repaired > 0 {
                self.notifier.toast(Toast::info(
                    TOAST_TITLE,
                    format!("Repaired {repaired} empty message(s)"),
                ));
                self.resume(session_id).await;
                return CompactionOutcome::Repaired { messages: repaired };
            }
        }

        if self.config.prune_first
            && let Some(pruning) = &self.pruning
        {
            self.prune_and_truncate(pruning, session_id);
        }

        if self.config.truncation
            && let Some((parts, freed_chars)) = self.truncate(session_id, state)
        {
            self.notifier.toast(Toast::info(
                TOAST_TITLE,
                format!("Truncated {parts} large tool output(s)"),
            ));
            self.resume(session_id).await;
            return CompactionOutcome::Truncated { parts, freed_chars };
        }

        self.summarize_with_fallback(session_id, error, model_hint)
            .await
    }

    /// Replace or inject text in every empty message the error points at.
    fn repair_empty_messages(&self, session_id: &SessionId, index: Option<usize>) -> usize {
        let targeted = index.and_then(|index| {
            self.store
                .find_empty_message_by_index(session_id, index)
                .map_err(|err| warn!(session = %session_id, "Failed to locate empty message: {err}"))
                .ok()
                .flatten()
        });
        let targets = match targeted {
            Some(id) => vec![id],
            None => self.store.find_empty_messages(session_id).unwrap_or_else(|err| {
                warn!(session = %session_id, "Failed to scan for empty messages: {err}");
                Vec::new()
            }),
        };

        targets
            .iter()
            .filter(|message_id| {
                self.store
                    .replace_empty_text_parts(session_id, message_id, PLACEHOLDER_TEXT)
                    || self
                        .store
                        .inject_text_part(session_id, message_id, PLACEHOLDER_TEXT)
            })
            .count()
    }

    fn prune_and_truncate(&self, pruning: &PruningService, session_id: &SessionId) {
        let marked = pruning.execute_pruning(session_id, PruningMode::Commit);
        let truncated = pruning
            .marked_tool_outputs(session_id)
            .iter()
            .filter_map(|(message_id, part_id)| self.store.truncate_tool_output(message_id, part_id))
            .count();
        debug!(session = %session_id, marked, truncated, "Pre-compaction pruning");
    }

    /// Truncate toward the target. `Some` when the result is enough to resume.
    fn truncate(&self, session_id: &SessionId, state: &CompactionState) -> Option<(usize, usize)> {
        let remaining = self
            .config
            .max_truncation_attempts
            .saturating_sub(state.truncation_attempts);
        if remaining == 0 {
            debug!(session = %session_id, "Truncation budget spent");
            return None;
        }

        let known = state
            .last_error
            .as_ref()
            .and_then(|error| Some((error.current_tokens?, error.max_tokens?)))
            .filter(|&(_, max)| max > 0);
        let target = match known {
            Some((current, max)) => TruncationTarget::for_overflow(
                current,
                max,
                self.config.target_ratio,
                remaining,
                self.config.min_output_chars,
            ),
            None => TruncationTarget::largest_only(self.config.min_output_chars),
        };

        let outcome = self.store.truncate_until_target(session_id, target);
        self.states.with(session_id, |state| {
            if let Some(state) = state {
                state.truncation_attempts += outcome.truncated;
            }
        });
        info!(
            session = %session_id,
            truncated = outcome.truncated,
            freed_chars = outcome.freed_chars,
            sufficient = outcome.sufficient,
            "Tool output truncation"
        );
        outcome
            .sufficient
            .then_some((outcome.truncated, outcome.freed_chars))
    }

    async fn summarize_with_fallback(
        &self,
        session_id: &SessionId,
        error: Option<&ParsedRecoveryError>,
        model_hint: Option<ModelRef>,
    ) -> CompactionOutcome {
        let primary = model_hint
            .or_else(|| error.and_then(error_model))
            .or_else(|| self.session_model(session_id));
        let mut chain: Vec<ModelRef> = primary.into_iter().collect();
        for model in self.config.fallback_chain() {
            if !chain.contains(&model) {
                chain.push(model);
            }
        }

        for (index, model) in chain.iter().enumerate() {
            self.states.with(session_id, |state| {
                if let Some(state) = state {
                    state.fallback_index = index;
                }
            });
            if index > 0 {
                self.notifier.toast(Toast::warning(
                    TOAST_TITLE,
                    format!("Retrying compaction with {}", model.model_id),
                ));
            }

            for attempt in 0..self.config.max_summarize_attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.config.backoff(attempt - 1)).await;
                    if !self.still_compacting(session_id) {
                        return CompactionOutcome::Skipped;
                    }
                }
                self.states.with(session_id, |state| {
                    if let Some(state) = state {
                        state.retry_count += 1;
                    }
                });

                let result = self.api.summarize(session_id, model).await;
                if !self.still_compacting(session_id) {
                    return CompactionOutcome::Skipped;
                }
                match result {
                    Ok(()) => {
                        info!(session = %session_id, model = %model.model_id, attempt, "Session summarized");
                        self.notifier
                            .toast(Toast::success(TOAST_TITLE, "Session compacted"));
                        self.resume(session_id).await;
                        return CompactionOutcome::Summarized {
                            model: model.clone(),
                        };
                    }
                    Err(err) => {
                        warn!(session = %session_id, model = %model.model_id, attempt, "Summarize failed: {err}");
                    }
                }
            }
        }

        warn!(session = %session_id, models = chain.len(), "Compaction exhausted");
        self.notifier.toast(Toast::error(
            TOAST_TITLE,
            "Could not recover from the context limit. Start a new session or compact manually.",
        ));
        CompactionOutcome::Exhausted
    }

    fn still_compacting(&self, session_id: &SessionId) -> bool {
        self.states.with(session_id, |state| {
            state.is_some_and(|s| s.phase == CompactionPhase::Compacting)
        })
    }

    /// Settle the state this procedure owns. A state that is no longer
    /// `Compacting` was recreated after a deletion and is left alone.
    fn finish(&self, session_id: &SessionId, outcome: &CompactionOutcome) {
        let clear = matches!(
            outcome,
            CompactionOutcome::Summarized { .. } | CompactionOutcome::Exhausted
        );
        let finished = self.states.with(session_id, |state| {
            let state = state.filter(|s| s.phase == CompactionPhase::Compacting)?;
            let queued = state.queued_error.take();
            state.last_error = None;
            state.phase = CompactionPhase::Idle;
            Some(queued)
        });

        if let Some(queued) = finished {
            if clear {
                self.states.remove(session_id);
            }
            if let Some(error) = queued {
                self.states.entry(session_id, |state| {
                    state.phase = CompactionPhase::Pending;
                    state.last_error = Some(error);
                });
            }
        }
        self.release(session_id);
    }

    fn mark_recovering(&self, session_id: &SessionId) {
        for listener in &self.listeners {
            listener.mark_recovering(session_id);
        }
    }

    /// Let the listeners run again unless another cycle is still due.
    fn release(&self, session_id: &SessionId) {
        let due = self.states.with(session_id, |state| {
            state.is_some_and(|s| s.phase != CompactionPhase::Idle)
        });
        if due {
            return;
        }
        for listener in &self.listeners {
            listener.mark_recovery_complete(session_id);
        }
    }

    async fn resume(&self, session_id: &SessionId) {
        let (agent, model) = self.last_agent_and_model(session_id);
        let request = PromptRequest::text(RESUME_PROMPT)
            .with_agent(agent)
            .with_model(model);
        if let Err(err) = self.api.send_prompt(session_id, request).await {
            warn!(session = %session_id, "Failed to resume session: {err}");
        }
    }

    fn session_model(&self, session_id: &SessionId) -> Option<ModelRef> {
        self.last_agent_and_model(session_id).1
    }

    fn last_agent_and_model(&self, session_id: &SessionId) -> (Option<String>, Option<ModelRef>) {
        let infos = match self.store.list_message_infos(session_id) {
            Ok(infos) => infos,
            Err(err) => {
                debug!(session = %session_id, "No transcript for model lookup: {err}");
                return (None, None);
            }
        };
        let agent = infos.iter().rev().find_map(|info| info.agent.clone());
        let model = infos.iter().rev().find_map(keel_types::MessageInfo::model);
        (agent, model)
    }
}

fn error_model(error: &ParsedRecoveryError) -> Option<ModelRef> {
    Some(ModelRef::new(
        error.provider_id.clone()?,
        error.model_id.clone()?,
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_context::TRUNCATION_NOTICE;
    use keel_types::{MessageInfo, PartKind, ToolState};
    use serde_json::json;

    use super::*;
    use crate::notifications::ToastVariant;
    use crate::testing::{Harness, Seeder};

    const SESSION: &str = "ses_1";

    fn session() -> SessionId {
        SessionId::new(SESSION)
    }

    fn orchestrator(harness: &Harness, config: CompactionConfig) -> CompactionOrchestrator {
        CompactionOrchestrator::new(
            harness.api.clone(),
            harness.notifier.clone(),
            Arc::clone(&harness.store),
            ErrorClassifier::default(),
            config,
        )
    }

    fn big_output(tool: &str, len: usize) -> PartKind {
        PartKind::Tool {
            call_id: format!("call_{tool}"),
            tool: tool.to_string(),
            state: ToolState::completed(json!({}), "x".repeat(len)),
        }
    }

    fn with_model(info: MessageInfo) -> MessageInfo {
        info.with_agent("build")
            .with_model(&ModelRef::new("anthropic", "claude-sonnet-4"))
    }

    fn overflow_error() -> Value {
        json!({"message": "prompt is too long: 150000 tokens > 100000 maximum"})
    }

    fn idle() -> HostEvent {
        HostEvent::SessionIdle {
            session_id: session(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn truncation_recovers_when_enough_is_freed() {
        let harness = Harness::new();
        let mut seeder = Seeder::new(&harness.store, SESSION);
        seeder.user("go");
        seeder.message(
            with_model,
            Role::Assistant,
            vec![big_output("bash", 500_000), big_output("read", 1_000)],
        );
        let compaction = orchestrator(&harness, CompactionConfig::default());

        assert!(compaction.record_error(&session(), &overflow_error(), None));
        assert_eq!(compaction.phase(&session()), CompactionPhase::Pending);

        compaction.handle_event(&idle()).await;

        let snapshot = compaction.snapshot(&session());
        assert_eq!(snapshot.phase, CompactionPhase::Idle);
        assert_eq!(snapshot.truncation_attempts, 1);
        assert!(harness.api.summaries().is_empty());
        let prompts = harness.api.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].1.joined_text(), RESUME_PROMPT);
        assert_eq!(prompts[0].1.agent.as_deref(), Some("build"));

        let part = harness
            .store
            .read_part(&"msg_0002".into(), &"prt_0002_01".into())
            .unwrap()
            .unwrap();
        let PartKind::Tool { state, .. } = part.kind else {
            panic!("expected tool part");
        };
        assert_eq!(state.output.as_deref(), Some(TRUNCATION_NOTICE));
    }

    #[tokio::test(start_paused = true)]
    async fn summarize_retries_with_backoff() {
        let harness = Harness::new();
        let mut seeder = Seeder::new(&harness.store, SESSION);
        seeder.user("go");
        seeder.message(with_model, Role::Assistant, vec![PartKind::text("hi")]);
        harness.api.script_summaries(&[false, true]);
        let compaction = orchestrator(&harness, CompactionConfig::default());

        compaction.record_error(&session(), &overflow_error(), None);
        let started = tokio::time::Instant::now();
        compaction.handle_event(&idle()).await;

        // 300ms debounce plus one 2s backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(2_300));
        let summaries = harness.api.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].1, ModelRef::new("anthropic", "claude-sonnet-4"));
        assert_eq!(harness.api.prompt_texts(), vec![RESUME_PROMPT]);
        assert_eq!(harness.notifier.count(ToastVariant::Success), 1);
        assert_eq!(compaction.phase(&session()), CompactionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_then_exhausts() {
        let harness = Harness::new();
        let mut seeder = Seeder::new(&harness.store, SESSION);
        seeder.message(with_model, Role::Assistant, vec![PartKind::text("hi")]);
        harness.api.script_summaries(&[false, false, false, false]);
        let config = CompactionConfig {
            fallback_models: vec![crate::config::FallbackModel {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
            }],
            ..CompactionConfig::default()
        };
        let compaction = orchestrator(&harness, config);

        let outcome = compaction.execute_compaction(&session(), None).await;

        assert_eq!(outcome, CompactionOutcome::Exhausted);
        let models: Vec<_> = harness
            .api
            .summaries()
            .into_iter()
            .map(|(_, model)| model.model_id)
            .collect();
        assert_eq!(models, vec!["claude-sonnet-4", "claude-sonnet-4", "gpt-4o", "gpt-4o"]);
        assert_eq!(harness.notifier.count(ToastVariant::Error), 1);
        assert!(harness.api.prompts().is_empty());
        assert_eq!(compaction.phase(&session()), CompactionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_content_violation_repairs_and_resumes() {
        let harness = Harness::new();
        let mut seeder = Seeder::new(&harness.store, SESSION);
        seeder.user("go");
        seeder.assistant(vec![PartKind::thinking("hmm")]);
        seeder.user("again");
        let compaction = orchestrator(&harness, CompactionConfig::default());

        let error = json!({"message": "messages.1: all messages must have non-empty content"});
        assert!(compaction.record_error(&session(), &error, None));
        assert_eq!(
            compaction.pending_error(&session()).map(|e| e.kind),
            Some(RecoveryErrorKind::NonEmptyContentViolation)
        );

        compaction.handle_event(&idle()).await;

        let message = harness
            .store
            .read_message(&session(), &"msg_0002".into())
            .unwrap()
            .unwrap();
        assert_eq!(message.text(), PLACEHOLDER_TEXT);
        assert_eq!(harness.api.prompt_texts(), vec![RESUME_PROMPT]);
        assert!(harness.api.summaries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn summary_message_clears_pending() {
        let harness = Harness::new();
        let mut seeder = Seeder::new(&harness.store, SESSION);
        seeder.message(
            |info| info.with_summary(),
            Role::Assistant,
            vec![PartKind::text("summary")],
        );
        let compaction = orchestrator(&harness, CompactionConfig::default());

        compaction.record_error(&session(), &overflow_error(), None);
        compaction.handle_event(&idle()).await;

        assert_eq!(compaction.phase(&session()), CompactionPhase::Idle);
        assert!(compaction.pending_error(&session()).is_none());
        assert!(harness.api.summaries().is_empty());
        assert!(harness.api.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_during_debounce_abandons_the_procedure() {
        let harness = Harness::new();
        Seeder::new(&harness.store, SESSION).message(
            with_model,
            Role::Assistant,
            vec![PartKind::text("hi")],
        );
        let compaction = Arc::new(orchestrator(&harness, CompactionConfig::default()));
        compaction.record_error(&session(), &overflow_error(), None);

        let running = {
            let compaction = Arc::clone(&compaction);
            tokio::spawn(async move { compaction.handle_event(&idle()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        compaction
            .handle_event(&HostEvent::SessionDeleted {
                session_id: session(),
            })
            .await;
        running.await.unwrap();

        assert!(harness.api.summaries().is_empty());
        assert!(harness.api.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn error_after_deletion_survives_the_abandoned_run() {
        let harness = Harness::new();
        Seeder::new(&harness.store, SESSION).message(
            with_model,
            Role::Assistant,
            vec![PartKind::text("hi")],
        );
        harness.api.script_summaries(&[false]);
        let compaction = Arc::new(orchestrator(&harness, CompactionConfig::default()));

        let running = {
            let compaction = Arc::clone(&compaction);
            tokio::spawn(async move { compaction.execute_compaction(&session(), None).await })
        };
        // Past the first failed summarize, inside the backoff.
        tokio::time::sleep(Duration::from_secs(1)).await;
        compaction
            .handle_event(&HostEvent::SessionDeleted {
                session_id: session(),
            })
            .await;
        assert!(compaction.record_error(&session(), &overflow_error(), None));

        assert_eq!(running.await.unwrap(), CompactionOutcome::Skipped);
        assert_eq!(harness.api.summaries().len(), 1);
        assert_eq!(compaction.phase(&session()), CompactionPhase::Pending);
        assert!(compaction.pending_error(&session()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_procedure_runs_at_a_time() {
        let harness = Harness::new();
        Seeder::new(&harness.store, SESSION).message(
            with_model,
            Role::Assistant,
            vec![PartKind::text("hi")],
        );
        let compaction = orchestrator(&harness, CompactionConfig::default());

        let session = session();
        let (first, second) = tokio::join!(
            compaction.execute_compaction(&session, None),
            compaction.execute_compaction(&session, None),
        );

        assert!(matches!(first, CompactionOutcome::Summarized { .. }));
        assert_eq!(second, CompactionOutcome::Skipped);
        assert_eq!(harness.api.summaries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_during_compaction_queue_for_next_cycle() {
        let harness = Harness::new();
        Seeder::new(&harness.store, SESSION).message(
            with_model,
            Role::Assistant,
            vec![PartKind::text("hi")],
        );
        let compaction = Arc::new(orchestrator(&harness, CompactionConfig::default()));

        let running = {
            let compaction = Arc::clone(&compaction);
            tokio::spawn(async move { compaction.execute_compaction(&session(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(compaction.phase(&session()), CompactionPhase::Compacting);
        compaction.record_error(&session(), &overflow_error(), None);
        running.await.unwrap();

        // The finished run cleared its counters; only the queued error remains.
        let snapshot = compaction.snapshot(&session());
        assert_eq!(snapshot.phase, CompactionPhase::Pending);
        assert_eq!(snapshot.retry_count, 0);
    }

    #[test]
    fn unrelated_errors_are_ignored() {
        let harness = Harness::new();
        let compaction = orchestrator(&harness, CompactionConfig::default());
        assert!(!compaction.record_error(&session(), &json!({"message": "rate limited"}), None));
        assert_eq!(compaction.phase(&session()), CompactionPhase::Idle);
    }
}

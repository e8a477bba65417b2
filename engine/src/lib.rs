//! Core engine for Keel: reacts to host session events.
//!
//! Five components share one event stream:
//! - [`SessionRecovery`] repairs transcripts the provider rejected for their shape.
//! - [`CompactionOrchestrator`] recovers from context-window overflow.
//! - [`PruningService`] marks redundant tool output for the context renderer.
//! - [`IdleNudge`] re-prompts idle sessions that still have open todos.
//! - [`SelfLoop`] drives a bounded "keep going until done" loop.
//!
//! The host feeds events in through [`Keel::dispatch`] or
//! [`Keel::dispatch_value`] and provides its side through [`HostPorts`].

use std::sync::Arc;

use serde_json::Value;

use keel_context::{ErrorClassifier, PruningMode, TranscriptStore};
use keel_types::{BoundedLoopState, HostEvent, ModelRef, ParsedRecoveryError, SessionId};

mod compaction;
mod config;
mod continuation;
mod dispatch;
mod init;
mod notifications;
mod ports;
mod pruning;
mod recovery;
mod self_loop;
mod session_table;

#[cfg(test)]
mod testing;

pub use compaction::{
    CompactionOrchestrator, CompactionOutcome, CompactionPhase, CompactionSnapshot, RESUME_PROMPT,
};
pub use config::{
    CompactionConfig, ConfigError, ContinuationConfig, FallbackModel, KeelConfig,
    ModelLimitOverride, PruningSettings, RecoveryConfig, SelfLoopConfig, StorageConfig,
    config_path,
};
pub use continuation::{CONTINUATION_PROMPT, IdleNudge, continuation_prompt};
pub use dispatch::{Dispatcher, EventHandler, HandlerFut};
pub use init::HostPorts;
pub use notifications::{LogNotifier, Notifier, Toast, ToastVariant};
pub use ports::{
    ApiError, ApiFut, BackgroundTasks, ConversationApi, NoBackgroundTasks, RecoveryListener,
    SessionInfo,
};
pub use pruning::PruningService;
pub use recovery::{CANCELLED_TOOL_RESULT, SessionRecovery};
pub use self_loop::{LoopStateError, LoopStateFile, SelfLoop, contains_completion, loop_prompt};

/// The assembled engine. Build with [`Keel::new`] or [`Keel::from_config`].
pub struct Keel {
    store: Arc<TranscriptStore>,
    classifier: ErrorClassifier,
    compaction: Arc<CompactionOrchestrator>,
    pruning: Arc<PruningService>,
    nudge: Arc<IdleNudge>,
    self_loop: Arc<SelfLoop>,
    dispatcher: Dispatcher,
}

impl Keel {
    pub async fn dispatch(&self, event: &HostEvent) {
        self.dispatcher.dispatch(event).await;
    }

    pub async fn dispatch_value(&self, raw: &Value) -> bool {
        self.dispatcher.dispatch_value(raw).await
    }

    #[must_use]
    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    #[must_use]
    pub fn classify(
        &self,
        raw: &Value,
        provider_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Option<ParsedRecoveryError> {
        self.classifier.classify(raw, provider_id, model_id)
    }

    pub async fn execute_compaction(
        &self,
        session_id: &SessionId,
        model: Option<ModelRef>,
    ) -> CompactionOutcome {
        self.compaction.execute_compaction(session_id, model).await
    }

    pub fn execute_pruning(&self, session_id: &SessionId, mode: PruningMode) -> usize {
        self.pruning.execute_pruning(session_id, mode)
    }

    #[must_use]
    pub fn pruning(&self) -> &PruningService {
        &self.pruning
    }

    #[must_use]
    pub fn compaction(&self) -> &CompactionOrchestrator {
        &self.compaction
    }

    #[must_use]
    pub fn nudge(&self) -> &IdleNudge {
        &self.nudge
    }

    pub fn start_loop(
        &self,
        session_id: &SessionId,
        prompt: impl Into<String>,
        max_iterations: Option<u32>,
        completion_promise: Option<String>,
    ) -> Result<BoundedLoopState, LoopStateError> {
        self.self_loop
            .start(session_id, prompt, max_iterations, completion_promise)
    }

    pub fn cancel_loop(&self, session_id: &SessionId) -> Result<bool, LoopStateError> {
        self.self_loop.cancel(session_id)
    }

    #[must_use]
    pub fn loop_state(&self) -> Option<BoundedLoopState> {
        self.self_loop.state()
    }

    /// Pause both schedulers for a session while an outside repair runs.
    pub fn mark_recovering(&self, session_id: &SessionId) {
        self.nudge.mark_recovering(session_id);
        self.self_loop.mark_recovering(session_id);
    }

    pub fn mark_recovery_complete(&self, session_id: &SessionId) {
        self.nudge.mark_recovery_complete(session_id);
        self.self_loop.mark_recovery_complete(session_id);
    }
}

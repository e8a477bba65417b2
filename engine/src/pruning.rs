use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use keel_context::{Pruner, PruningConfig, PruningMode, PruningState, TranscriptStore};
use keel_types::{HostEvent, MessageId, PartId, SessionId};

use crate::session_table::SessionTable;

/// Per-session pruning state over the stored transcript.
pub struct PruningService {
    store: Arc<TranscriptStore>,
    pruner: Pruner,
    states: SessionTable<PruningState>,
}

impl PruningService {
    #[must_use]
    pub fn new(store: Arc<TranscriptStore>, config: PruningConfig) -> Self {
        Self {
            store,
            pruner: Pruner::new(config),
            states: SessionTable::new(),
        }
    }

    /// Analyze the session and return how many tool calls are newly marked.
    ///
    /// [`PruningMode::DryRun`] reports the count without touching the stored
    /// marks. A transcript that cannot be read prunes nothing.
    pub fn execute_pruning(&self, session_id: &SessionId, mode: PruningMode) -> usize {
        let messages = match self.store.list_messages(session_id) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(session = %session_id, "Pruning skipped, transcript unreadable: {err}");
                return 0;
            }
        };
        let analysis = self.pruner.analyze(&messages);

        let newly = match mode {
            PruningMode::DryRun => match self.states.get(session_id) {
                Some(mut existing) => existing.merge(analysis),
                None => analysis.marked_calls(),
            },
            PruningMode::Commit => self
                .states
                .entry(session_id, |state| state.merge(analysis)),
        };

        if newly > 0 {
            info!(session = %session_id, ?mode, newly, "Pruning marked tool calls");
        } else {
            debug!(session = %session_id, ?mode, "Pruning found nothing new");
        }
        newly
    }

    /// Committed marks for a session, for the context renderer.
    #[must_use]
    pub fn marked_parts(&self, session_id: &SessionId) -> BTreeSet<PartId> {
        self.states
            .with(session_id, |state| state.map(|s| s.marked().clone()))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn state(&self, session_id: &SessionId) -> Option<PruningState> {
        self.states.get(session_id)
    }

    /// `(message, part)` of every marked call from the latest committed pass.
    #[must_use]
    pub fn marked_tool_outputs(&self, session_id: &SessionId) -> Vec<(MessageId, PartId)> {
        self.states
            .with(session_id, |state| {
                state.map(|state| {
                    state
                        .calls()
                        .iter()
                        .filter(|call| state.is_marked(call.primary_part()))
                        .map(|call| (call.message_id.clone(), call.primary_part().clone()))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn handle_event(&self, event: &HostEvent) {
        if let HostEvent::SessionDeleted { session_id } = event
            && self.states.remove(session_id).is_some()
        {
            debug!(session = %session_id, "Dropped pruning state");
        }
    }
}

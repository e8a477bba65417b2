use serde::{Deserialize, Serialize};

use crate::SessionId;

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_COMPLETION_PROMISE: &str = "DONE";

/// State of a bounded self-loop, persisted next to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedLoopState {
    pub active: bool,
    /// 1-based iteration currently in flight.
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_promise: String,
    /// RFC 3339 timestamp.
    pub started_at: String,
    pub prompt: String,
    pub session_id: SessionId,
}

impl BoundedLoopState {
    #[must_use]
    pub fn is_owned_by(&self, session_id: &SessionId) -> bool {
        &self.session_id == session_id
    }
}

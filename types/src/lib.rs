//! Core domain types for Keel.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer: the transcript model shared by the
//! repair and pruning engines, the typed host events, and the classified recovery error.

mod event;
mod ids;
mod loop_state;
mod prompt;
mod recovery;
mod todo;
mod transcript;

pub use event::{HostEvent, error_name, is_abort_error};
pub use ids::{MessageId, PartId, SessionId};
pub use loop_state::{BoundedLoopState, DEFAULT_COMPLETION_PROMISE, DEFAULT_MAX_ITERATIONS};
pub use prompt::{ModelRef, PromptPart, PromptRequest};
pub use recovery::{ParsedRecoveryError, RecoveryErrorKind};
pub use todo::{Todo, TodoProgress, TodoStatus};
pub use transcript::{
    MessageInfo, Part, PartKind, PersistedMessage, Role, ToolState, ToolStatus,
};

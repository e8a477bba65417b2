//! Transcript-side building blocks for context-window recovery
//!
//! This crate provides:
//! - Model-specific context window limits
//! - Classification of provider errors into recoverable kinds
//! - The on-disk transcript store and its repair operations
//! - Truncation of oversized tool outputs
//! - Pruning analysis over tool calls
//!
//! # Architecture
//!
//! ```text
//! TranscriptStore (message/<session>/*.json, part/<message>/*.json)
//! ├── repair: finders + idempotent mutations
//! └── truncation: largest-first tool output truncation
//!
//! ErrorClassifier
//! └── registry: ModelRegistry (limits per model)
//!
//! Pruner (pure analysis, never mutates the store)
//! └── PruningState (marks only grow)
//! ```
//!
//! Nothing here spawns tasks or talks to the host; the engine crate drives
//! these pieces from host events.

mod atomic_write;
mod classifier;
mod model_limits;
mod pruning;
mod repair;
mod store;
mod truncation;

pub use atomic_write::{AtomicWriteOptions, atomic_write, atomic_write_with_options};
pub use classifier::{ErrorClassifier, classify, detect_structural_error, gather_messages};
pub use model_limits::{
    ModelLimits, ModelLimitsSource, ModelRegistry, ProviderFamily, ResolvedModelLimits,
};
pub use pruning::{
    DEFAULT_PROTECTED_TOOLS, PruneReason, Pruner, PruningConfig, PruningMode, PruningState,
    ToolCallRecord, canonical_signature, without_marked_parts,
};
pub use repair::{PLACEHOLDER_TEXT, THINKING_PLACEHOLDER, find_orphaned_tool_uses};
pub use store::{StoreError, TranscriptStore};
pub use truncation::{
    CHARS_PER_TOKEN, TRUNCATION_NOTICE, ToolOutputRef, TruncationOutcome, TruncationTarget,
};

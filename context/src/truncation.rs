//! Replacing oversized tool outputs with a fixed notice.
//!
//! Truncation is the cheapest way out of a context overflow: the transcript
//! keeps its shape and every tool call keeps its result, only the bulky output
//! text goes away.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use keel_types::{MessageId, PartId, PartKind, SessionId, ToolStatus};

use crate::store::{StoreError, TranscriptStore};

/// Text that replaces a truncated tool output.
pub const TRUNCATION_NOTICE: &str = "[TOOL RESULT TRUNCATED - Context limit exceeded. Original output was too large and has been truncated to recover the session. Please re-run this tool if you need the full output.]";

/// Rough conversion used to turn a token deficit into a character budget.
pub const CHARS_PER_TOKEN: u64 = 4;

/// A completed tool output that is still present in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutputRef {
    pub message_id: MessageId,
    pub part_id: PartId,
    pub tool: String,
    pub output_len: usize,
}

/// How much to truncate in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationTarget {
    /// Characters that must be freed. `None` when the overflow size is unknown.
    pub chars_to_free: Option<usize>,
    /// Upper bound on outputs truncated in this pass.
    pub max_parts: usize,
    /// Outputs at or below this size are never worth truncating.
    pub min_output_chars: usize,
}

impl TruncationTarget {
    /// Target that brings usage down to `ratio` of the context window.
    #[must_use]
    pub fn for_overflow(
        current_tokens: u64,
        max_tokens: u64,
        ratio: f64,
        max_parts: usize,
        min_output_chars: usize,
    ) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target_tokens = (max_tokens as f64 * ratio.clamp(0.0, 1.0)) as u64;
        let excess = current_tokens.saturating_sub(target_tokens);
        let chars = excess.saturating_mul(CHARS_PER_TOKEN);
        Self {
            chars_to_free: Some(usize::try_from(chars).unwrap_or(usize::MAX)),
            max_parts,
            min_output_chars,
        }
    }

    /// Truncate only the single largest output.
    #[must_use]
    pub fn largest_only(min_output_chars: usize) -> Self {
        Self {
            chars_to_free: None,
            max_parts: 1,
            min_output_chars,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncationOutcome {
    pub truncated: usize,
    pub freed_chars: usize,
    /// The target was met. With an unknown target this means anything at all
    /// was truncated.
    pub sufficient: bool,
}

impl TranscriptStore {
    /// Completed tool outputs larger than `min_chars`, largest first.
    pub fn find_tool_outputs_by_size(
        &self,
        session_id: &SessionId,
        min_chars: usize,
    ) -> Result<Vec<ToolOutputRef>, StoreError> {
        let mut outputs: Vec<ToolOutputRef> = self
            .list_messages(session_id)?
            .into_iter()
            .flat_map(|message| message.parts)
            .filter_map(|part| {
                let PartKind::Tool { tool, state, .. } = part.kind else {
                    return None;
                };
                if state.status != ToolStatus::Completed || state.compacted_at.is_some() {
                    return None;
                }
                let output_len = state.output.as_deref().map_or(0, str::len);
                (output_len > min_chars).then(|| ToolOutputRef {
                    message_id: part.message_id,
                    part_id: part.id,
                    tool,
                    output_len,
                })
            })
            .collect();
        outputs.sort_by(|a, b| b.output_len.cmp(&a.output_len).then_with(|| a.part_id.cmp(&b.part_id)));
        Ok(outputs)
    }

    /// Replace one tool output with [`TRUNCATION_NOTICE`].
    ///
    /// Returns the number of characters freed, or `None` if the part is gone,
    /// not a completed tool output, already truncated, or could not be written.
    pub fn truncate_tool_output(&self, message_id: &MessageId, part_id: &PartId) -> Option<usize> {
        let mut part = match self.read_part(message_id, part_id) {
            Ok(Some(part)) => part,
            Ok(None) => return None,
            Err(err) => {
                warn!(part = %part_id, "Failed to read tool output for truncation: {err}");
                return None;
            }
        };
        let PartKind::Tool { state, .. } = &mut part.kind else {
            return None;
        };
        if state.status != ToolStatus::Completed || state.compacted_at.is_some() {
            return None;
        }

        let original = state.output.as_deref().map_or(0, str::len);
        state.output = Some(TRUNCATION_NOTICE.to_string());
        state.compacted_at = Some(now_millis());

        if let Err(err) = self.write_part(&part) {
            warn!(part = %part_id, "Failed to persist truncated tool output: {err}");
            return None;
        }
        Some(original.saturating_sub(TRUNCATION_NOTICE.len()))
    }

    /// Truncate outputs, largest first, until `target` is met or the attempt
    /// budget runs out.
    pub fn truncate_until_target(&self, session_id: &SessionId, target: TruncationTarget) -> TruncationOutcome {
        let candidates = match self.find_tool_outputs_by_size(session_id, target.min_output_chars) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(session = %session_id, "Failed to scan tool outputs: {err}");
                return TruncationOutcome::default();
            }
        };

        let mut outcome = TruncationOutcome::default();
        for candidate in candidates.into_iter().take(target.max_parts) {
            if target
                .chars_to_free
                .is_some_and(|needed| outcome.freed_chars >= needed)
            {
                break;
            }
            if let Some(freed) = self.truncate_tool_output(&candidate.message_id, &candidate.part_id) {
                debug!(
                    session = %session_id,
                    part = %candidate.part_id,
                    tool = %candidate.tool,
                    freed,
                    "Truncated tool output"
                );
                outcome.truncated += 1;
                outcome.freed_chars += freed;
            }
        }

        outcome.sufficient = match target.chars_to_free {
            Some(needed) => outcome.truncated > 0 && outcome.freed_chars >= needed,
            None => outcome.truncated > 0,
        };
        outcome
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use keel_types::ToolState;
    use serde_json::json;

    use super::*;
    use crate::store::fixtures::TranscriptBuilder;

    fn tool_output(tool: &str, len: usize) -> PartKind {
        PartKind::Tool {
            call_id: format!("call_{tool}_{len}"),
            tool: tool.to_string(),
            state: ToolState::completed(json!({}), "x".repeat(len)),
        }
    }

    fn seeded() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        TranscriptBuilder::new("ses_1")
            .user("go")
            .assistant(vec![tool_output("read", 10_000), tool_output("grep", 200)])
            .assistant(vec![tool_output("bash", 40_000), tool_output("glob", 3_000)])
            .persist(&store);
        (dir, store)
    }

    #[test]
    fn outputs_are_listed_largest_first_above_minimum() {
        let (_dir, store) = seeded();
        let outputs = store
            .find_tool_outputs_by_size(&SessionId::new("ses_1"), 500)
            .unwrap();
        let tools: Vec<_> = outputs.iter().map(|o| o.tool.as_str()).collect();
        assert_eq!(tools, vec!["bash", "read", "glob"]);
    }

    #[test]
    fn truncation_stops_once_target_is_met() {
        let (_dir, store) = seeded();
        let session = SessionId::new("ses_1");
        let target = TruncationTarget {
            chars_to_free: Some(30_000),
            max_parts: 20,
            min_output_chars: 500,
        };

        let outcome = store.truncate_until_target(&session, target);
        assert_eq!(outcome.truncated, 1);
        assert!(outcome.sufficient);

        let remaining = store.find_tool_outputs_by_size(&session, 500).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn insufficient_when_outputs_run_out() {
        let (_dir, store) = seeded();
        let target = TruncationTarget {
            chars_to_free: Some(1_000_000),
            max_parts: 20,
            min_output_chars: 500,
        };
        let outcome = store.truncate_until_target(&SessionId::new("ses_1"), target);
        assert_eq!(outcome.truncated, 3);
        assert!(!outcome.sufficient);
    }

    #[test]
    fn truncated_outputs_carry_notice_and_are_not_truncated_twice() {
        let (_dir, store) = seeded();
        let message = MessageId::new("msg_0003");
        let part = PartId::new("prt_0003_01");

        let freed = store.truncate_tool_output(&message, &part).unwrap();
        assert_eq!(freed, 40_000 - TRUNCATION_NOTICE.len());
        assert_eq!(store.truncate_tool_output(&message, &part), None);

        let stored = store.read_part(&message, &part).unwrap().unwrap();
        let PartKind::Tool { state, .. } = stored.kind else {
            panic!("expected tool part");
        };
        assert_eq!(state.output.as_deref(), Some(TRUNCATION_NOTICE));
        assert!(state.compacted_at.is_some());
    }

    #[test]
    fn overflow_target_uses_ratio_of_window() {
        let target = TruncationTarget::for_overflow(150_000, 200_000, 0.5, 20, 500);
        assert_eq!(target.chars_to_free, Some(200_000));

        let under = TruncationTarget::for_overflow(50_000, 200_000, 0.5, 20, 500);
        assert_eq!(under.chars_to_free, Some(0));
    }

    #[test]
    fn largest_only_target() {
        let (_dir, store) = seeded();
        let outcome = store.truncate_until_target(&SessionId::new("ses_1"), TruncationTarget::largest_only(500));
        assert_eq!(outcome.truncated, 1);
        assert!(outcome.sufficient);
    }
}

//! Marking redundant tool calls so the rendered context can leave them out.
//!
//! Pruning never touches stored messages. [`Pruner::analyze`] walks a
//! transcript, records every tool call under a canonical signature, and marks
//! the part ids that the enabled passes consider redundant. The caller decides
//! whether the marks are committed (see [`PruningMode`]).
//!
//! Turns are counted by `step-start` markers. A call is inside the protected
//! window when fewer than `protected_turns` turns have started since it ran;
//! protected calls and calls to protected tools are never marked.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use serde_json::Value;

use keel_types::{MessageId, PartId, PartKind, PersistedMessage, ToolStatus};

/// Tools whose calls carry state the model relies on later.
pub const DEFAULT_PROTECTED_TOOLS: &[&str] = &[
    "task",
    "todowrite",
    "todoread",
    "lsp_rename",
    "lsp_code_action_resolve",
    "session_read",
    "session_write",
    "session_search",
];

const WRITE_TOOLS: &[&str] = &["write", "edit"];
const READ_TOOLS: &[&str] = &["read"];
const PATH_KEYS: &[&str] = &["filePath", "file_path", "path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PruningMode {
    /// Compute marks and counts without recording them.
    DryRun,
    /// Merge the marks into the session's pruning state.
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruningConfig {
    pub protected_tools: BTreeSet<String>,
    /// Trailing turns whose calls are never marked. `0` disables the window.
    pub protected_turns: u32,
    pub deduplicate: bool,
    pub purge_errors: bool,
    /// Age in turns after which a failed call's input is purged.
    pub purge_error_turns: u32,
    pub supersede_writes: bool,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            protected_tools: DEFAULT_PROTECTED_TOOLS
                .iter()
                .map(|tool| (*tool).to_string())
                .collect(),
            protected_turns: 3,
            deduplicate: true,
            purge_errors: true,
            purge_error_turns: 5,
            supersede_writes: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PruneReason {
    Duplicate,
    StaleError,
    SupersededWrite,
}

impl PruneReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::StaleError => "stale_error",
            Self::SupersededWrite => "superseded_write",
        }
    }
}

/// One tool call seen during analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub message_id: MessageId,
    /// Every part id the call occupies: the combined tool part, or a
    /// `tool_use` part plus its `tool_result` part.
    pub part_ids: Vec<PartId>,
    pub tool: String,
    pub input: Value,
    pub turn: u32,
    pub signature: String,
    pub errored: bool,
}

impl ToolCallRecord {
    #[must_use]
    pub fn primary_part(&self) -> &PartId {
        &self.part_ids[0]
    }

    fn file_path(&self) -> Option<&str> {
        PATH_KEYS
            .iter()
            .find_map(|key| self.input.get(*key).and_then(Value::as_str))
    }
}

/// Per-session pruning bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruningState {
    marked: BTreeSet<PartId>,
    reasons: BTreeMap<PartId, PruneReason>,
    calls: Vec<ToolCallRecord>,
    signatures: BTreeMap<String, Vec<usize>>,
    current_turn: u32,
}

impl PruningState {
    #[must_use]
    pub fn marked(&self) -> &BTreeSet<PartId> {
        &self.marked
    }

    #[must_use]
    pub fn is_marked(&self, part_id: &PartId) -> bool {
        self.marked.contains(part_id)
    }

    #[must_use]
    pub fn reason(&self, part_id: &PartId) -> Option<PruneReason> {
        self.reasons.get(part_id).copied()
    }

    #[must_use]
    pub fn calls(&self) -> &[ToolCallRecord] {
        &self.calls
    }

    /// Calls grouped by canonical signature, in transcript order.
    pub fn signature_groups(&self) -> impl Iterator<Item = (&str, Vec<&ToolCallRecord>)> {
        self.signatures.iter().map(|(signature, indices)| {
            (
                signature.as_str(),
                indices.iter().map(|&i| &self.calls[i]).collect(),
            )
        })
    }

    #[must_use]
    pub fn errored_calls(&self) -> Vec<&ToolCallRecord> {
        self.calls.iter().filter(|call| call.errored).collect()
    }

    #[must_use]
    pub fn current_turn(&self) -> u32 {
        self.current_turn
    }

    /// Number of calls currently marked.
    #[must_use]
    pub fn marked_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| self.marked.contains(call.primary_part()))
            .count()
    }

    /// Fold a fresh analysis into this state. Marks only grow; the call
    /// registry and turn counter follow the newer analysis.
    ///
    /// Returns how many calls became newly marked.
    pub fn merge(&mut self, analysis: PruningState) -> usize {
        let newly = analysis
            .calls
            .iter()
            .filter(|call| {
                analysis.marked.contains(call.primary_part())
                    && !self.marked.contains(call.primary_part())
            })
            .count();
        for (part, reason) in analysis.reasons {
            self.reasons.entry(part).or_insert(reason);
        }
        self.marked.extend(analysis.marked);
        self.calls = analysis.calls;
        self.signatures = analysis.signatures;
        self.current_turn = analysis.current_turn;
        newly
    }

    fn mark(&mut self, index: usize, reason: PruneReason) -> bool {
        let parts = self.calls[index].part_ids.clone();
        if self.marked.contains(&parts[0]) {
            return false;
        }
        for part in parts {
            self.reasons.entry(part.clone()).or_insert(reason);
            self.marked.insert(part);
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pruner {
    config: PruningConfig,
}

impl Pruner {
    #[must_use]
    pub fn new(config: PruningConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PruningConfig {
        &self.config
    }

    /// Scan a transcript and run every enabled pass over it.
    #[must_use]
    pub fn analyze(&self, messages: &[PersistedMessage]) -> PruningState {
        let mut state = scan(messages);
        if self.config.deduplicate {
            self.deduplicate(&mut state);
        }
        if self.config.purge_errors {
            self.purge_errors(&mut state);
        }
        if self.config.supersede_writes {
            self.supersede_writes(&mut state);
        }
        state
    }

    /// Mark every call in a duplicate group except the most recent one.
    pub fn deduplicate(&self, state: &mut PruningState) -> usize {
        let mut targets = Vec::new();
        for indices in state.signatures.values() {
            let Some((_, earlier)) = indices.split_last() else {
                continue;
            };
            targets.extend(
                earlier
                    .iter()
                    .copied()
                    .filter(|&i| !self.is_protected(&state.calls[i], state.current_turn)),
            );
        }
        mark_all(state, targets, PruneReason::Duplicate)
    }

    /// Mark failed calls that are at least `purge_error_turns` turns old.
    pub fn purge_errors(&self, state: &mut PruningState) -> usize {
        let threshold = self.config.purge_error_turns;
        let targets: Vec<usize> = state
            .calls
            .iter()
            .enumerate()
            .filter(|(_, call)| {
                call.errored
                    && state.current_turn.saturating_sub(call.turn) >= threshold
                    && !self.is_protected(call, state.current_turn)
            })
            .map(|(i, _)| i)
            .collect();
        mark_all(state, targets, PruneReason::StaleError)
    }

    /// Mark writes to a file that a later call reads back.
    pub fn supersede_writes(&self, state: &mut PruningState) -> usize {
        let mut last_read: HashMap<&str, usize> = HashMap::new();
        for (i, call) in state.calls.iter().enumerate() {
            if READ_TOOLS.contains(&call.tool.as_str())
                && let Some(path) = call.file_path()
            {
                last_read.insert(path, i);
            }
        }

        let targets: Vec<usize> = state
            .calls
            .iter()
            .enumerate()
            .filter(|(i, call)| {
                WRITE_TOOLS.contains(&call.tool.as_str())
                    && call
                        .file_path()
                        .and_then(|path| last_read.get(path))
                        .is_some_and(|read_at| read_at > i)
                    && !self.is_protected(call, state.current_turn)
            })
            .map(|(i, _)| i)
            .collect();
        mark_all(state, targets, PruneReason::SupersededWrite)
    }

    fn is_protected(&self, call: &ToolCallRecord, current_turn: u32) -> bool {
        if self.config.protected_tools.contains(&call.tool) {
            return true;
        }
        let window = self.config.protected_turns;
        window > 0 && current_turn.saturating_sub(call.turn) < window
    }
}

fn mark_all(state: &mut PruningState, targets: Vec<usize>, reason: PruneReason) -> usize {
    targets
        .into_iter()
        .filter(|&i| state.mark(i, reason))
        .count()
}

/// Build the call registry and turn counter for a transcript.
fn scan(messages: &[PersistedMessage]) -> PruningState {
    let mut state = PruningState::default();
    let mut turn = 0u32;
    let mut pending_uses: HashMap<&str, usize> = HashMap::new();

    for message in messages {
        for part in &message.parts {
            match &part.kind {
                PartKind::StepStart => turn += 1,
                PartKind::Tool { tool, state: tool_state, .. } => {
                    state.push_call(ToolCallRecord {
                        message_id: message.info.id.clone(),
                        part_ids: vec![part.id.clone()],
                        tool: tool.clone(),
                        input: tool_state.input.clone(),
                        turn,
                        signature: canonical_signature(tool, &tool_state.input),
                        errored: tool_state.status == ToolStatus::Error,
                    });
                }
                PartKind::ToolUse {
                    tool_use_id,
                    name,
                    input,
                } => {
                    let index = state.push_call(ToolCallRecord {
                        message_id: message.info.id.clone(),
                        part_ids: vec![part.id.clone()],
                        tool: name.clone(),
                        input: input.clone(),
                        turn,
                        signature: canonical_signature(name, input),
                        errored: false,
                    });
                    pending_uses.insert(tool_use_id.as_str(), index);
                }
                PartKind::ToolResult { tool_use_id, .. } => {
                    if let Some(index) = pending_uses.remove(tool_use_id.as_str()) {
                        state.calls[index].part_ids.push(part.id.clone());
                    }
                }
                PartKind::Text { .. } | PartKind::Thinking { .. } => {}
            }
        }
    }

    state.current_turn = turn;
    state
}

impl PruningState {
    fn push_call(&mut self, call: ToolCallRecord) -> usize {
        let index = self.calls.len();
        self.signatures
            .entry(call.signature.clone())
            .or_default()
            .push(index);
        self.calls.push(call);
        index
    }
}

/// `tool::<canonical json>`: object keys sorted at every depth and null
/// members dropped, so equivalent inputs share a signature regardless of key
/// order.
#[must_use]
pub fn canonical_signature(tool: &str, input: &Value) -> String {
    let mut out = String::with_capacity(tool.len() + 32);
    out.push_str(tool);
    out.push_str("::");
    write_canonical(input, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, member)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// A copy of `messages` without any marked part.
#[must_use]
pub fn without_marked_parts(
    messages: &[PersistedMessage],
    marked: &BTreeSet<PartId>,
) -> Vec<PersistedMessage> {
    messages
        .iter()
        .map(|message| {
            let parts = message
                .parts
                .iter()
                .filter(|part| !marked.contains(&part.id))
                .cloned()
                .collect();
            PersistedMessage::new(message.info.clone(), parts)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use keel_types::{Role, ToolState};
    use serde_json::json;

    use super::*;
    use crate::store::fixtures::TranscriptBuilder;

    fn call(tool: &str, input: Value) -> PartKind {
        PartKind::Tool {
            call_id: format!("call_{tool}"),
            tool: tool.to_string(),
            state: ToolState::completed(input, "out"),
        }
    }

    fn failed(tool: &str, input: Value) -> PartKind {
        PartKind::Tool {
            call_id: format!("call_{tool}"),
            tool: tool.to_string(),
            state: ToolState::errored(input, "boom"),
        }
    }

    /// One assistant message per turn, each starting a new step.
    fn turns(calls: Vec<PartKind>) -> Vec<PersistedMessage> {
        calls
            .into_iter()
            .fold(TranscriptBuilder::new("ses_1"), |builder, kind| {
                builder.assistant(vec![PartKind::StepStart, kind])
            })
            .build()
    }

    fn no_window() -> PruningConfig {
        PruningConfig {
            protected_turns: 0,
            ..PruningConfig::default()
        }
    }

    mod signatures {
        use super::*;

        #[test]
        fn key_order_and_nulls_do_not_matter() {
            let a = canonical_signature("read", &json!({"filePath": "/a", "limit": 10, "offset": null}));
            let b = canonical_signature("read", &json!({"limit": 10, "filePath": "/a"}));
            assert_eq!(a, b);
        }

        #[test]
        fn nested_objects_are_canonical() {
            let a = canonical_signature("x", &json!({"o": {"b": 1, "a": [ {"z": 1, "y": 2} ]}}));
            let b = canonical_signature("x", &json!({"o": {"a": [ {"y": 2, "z": 1} ], "b": 1}}));
            assert_eq!(a, b);
            assert_eq!(a, r#"x::{"o":{"a":[{"y":2,"z":1}],"b":1}}"#);
        }

        #[test]
        fn tool_name_is_part_of_signature() {
            let input = json!({"filePath": "/a"});
            assert_ne!(canonical_signature("read", &input), canonical_signature("write", &input));
        }
    }

    mod dedup {
        use super::*;

        #[test]
        fn keeps_only_latest_duplicate() {
            let messages = turns(vec![
                call("read", json!({"filePath": "/a"})),
                call("read", json!({"filePath": "/b"})),
                call("read", json!({"filePath": "/a"})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let state = Pruner::new(no_window()).analyze(&messages);

            assert_eq!(state.marked_calls(), 2);
            assert!(state.is_marked(&PartId::new("prt_0001_02")));
            assert!(state.is_marked(&PartId::new("prt_0003_02")));
            assert!(!state.is_marked(&PartId::new("prt_0004_02")));
            assert_eq!(state.reason(&PartId::new("prt_0001_02")), Some(PruneReason::Duplicate));
        }

        #[test]
        fn duplicates_inside_window_are_kept() {
            let messages = turns(vec![
                call("read", json!({"filePath": "/a"})),
                call("bash", json!({"command": "ls"})),
                call("bash", json!({"command": "ls"})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let state = Pruner::new(PruningConfig::default()).analyze(&messages);

            // current turn 4: turns 2..=4 are protected, turn 1 is not.
            assert_eq!(state.current_turn(), 4);
            assert!(state.is_marked(&PartId::new("prt_0001_02")));
            assert!(!state.is_marked(&PartId::new("prt_0002_02")));
            assert_eq!(state.marked_calls(), 1);
        }

        #[test]
        fn protected_tools_are_never_marked() {
            let messages = turns(vec![
                call("todowrite", json!({"todos": []})),
                call("todowrite", json!({"todos": []})),
            ]);
            let state = Pruner::new(no_window()).analyze(&messages);
            assert!(state.marked().is_empty());
        }

        #[test]
        fn tool_use_pairs_are_marked_together() {
            let messages = TranscriptBuilder::new("ses_1")
                .assistant(vec![
                    PartKind::StepStart,
                    PartKind::ToolUse {
                        tool_use_id: "u1".to_string(),
                        name: "grep".to_string(),
                        input: json!({"pattern": "fn"}),
                    },
                ])
                .message(
                    Role::User,
                    vec![PartKind::ToolResult {
                        tool_use_id: "u1".to_string(),
                        content: "hits".to_string(),
                    }],
                )
                .assistant(vec![PartKind::StepStart, call("grep", json!({"pattern": "fn"}))])
                .build();

            let state = Pruner::new(no_window()).analyze(&messages);
            assert_eq!(state.marked_calls(), 1);
            assert!(state.is_marked(&PartId::new("prt_0001_02")));
            assert!(state.is_marked(&PartId::new("prt_0002_01")));

            let rendered = without_marked_parts(&messages, state.marked());
            assert!(rendered[0].tool_use_ids().is_empty());
            assert!(rendered[1].tool_result_ids().is_empty());
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn purges_old_errors_only() {
            let mut calls = vec![
                failed("bash", json!({"command": "a"})),
                failed("bash", json!({"command": "b"})),
            ];
            calls.extend((0..5).map(|i| call("read", json!({"filePath": format!("/{i}")}))));
            let messages = turns(calls);
            let config = PruningConfig {
                protected_turns: 2,
                ..PruningConfig::default()
            };
            let state = Pruner::new(config).analyze(&messages);

            // current turn 7: first error age 6, second age 5, threshold 5.
            assert!(state.is_marked(&PartId::new("prt_0001_02")));
            assert!(state.is_marked(&PartId::new("prt_0002_02")));
            assert_eq!(state.reason(&PartId::new("prt_0002_02")), Some(PruneReason::StaleError));
            assert_eq!(state.errored_calls().len(), 2);
        }

        #[test]
        fn window_wins_over_age() {
            let messages = turns(vec![
                failed("bash", json!({"command": "a"})),
                call("read", json!({"filePath": "/x"})),
            ]);
            let config = PruningConfig {
                purge_error_turns: 1,
                protected_turns: 3,
                ..PruningConfig::default()
            };
            let state = Pruner::new(config).analyze(&messages);
            assert!(state.marked().is_empty());
        }
    }

    mod supersede {
        use super::*;

        #[test]
        fn disabled_by_default() {
            let messages = turns(vec![
                call("write", json!({"filePath": "/a", "content": "x"})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let state = Pruner::new(no_window()).analyze(&messages);
            assert!(state.marked().is_empty());
        }

        #[test]
        fn marks_write_followed_by_read() {
            let messages = turns(vec![
                call("write", json!({"filePath": "/a", "content": "x"})),
                call("edit", json!({"filePath": "/b"})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let config = PruningConfig {
                supersede_writes: true,
                ..no_window()
            };
            let state = Pruner::new(config).analyze(&messages);
            assert_eq!(state.marked_calls(), 1);
            assert_eq!(
                state.reason(&PartId::new("prt_0001_02")),
                Some(PruneReason::SupersededWrite)
            );
        }
    }

    mod merge {
        use super::*;

        #[test]
        fn marks_never_shrink_and_count_only_new() {
            let pruner = Pruner::new(no_window());
            let first = turns(vec![
                call("read", json!({"filePath": "/a"})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let mut state = PruningState::default();
            assert_eq!(state.merge(pruner.analyze(&first)), 1);
            assert_eq!(state.merge(pruner.analyze(&first)), 0);

            // An analysis of a shorter transcript marks nothing, but the old
            // mark stays.
            assert_eq!(state.merge(pruner.analyze(&first[..1])), 0);
            assert!(state.is_marked(&PartId::new("prt_0001_02")));
        }

        #[test]
        fn analysis_is_deterministic() {
            let messages = turns(vec![
                call("read", json!({"filePath": "/a"})),
                failed("bash", json!({})),
                call("read", json!({"filePath": "/a"})),
            ]);
            let pruner = Pruner::new(no_window());
            assert_eq!(pruner.analyze(&messages), pruner.analyze(&messages));
        }
    }
}

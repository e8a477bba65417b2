//! Locating and repairing malformed messages in a stored transcript.
//!
//! Finders are read-only. Mutations report `true` only when they changed
//! something, so running one twice is a no-op the second time. A mutation that
//! hits a store error logs it and reports `false`; recovery treats that as
//! "nothing repaired" and moves on.
//!
//! Repairs never delete tool-use or tool-result parts. Dropping one half of a
//! pair leaves the transcript invalid for every provider.

use std::collections::HashSet;

use tracing::{debug, warn};

use keel_types::{
    MessageId, Part, PartId, PartKind, PersistedMessage, SessionId, ToolStatus,
};

use crate::store::{StoreError, TranscriptStore};

/// Replacement text for empty or interrupted assistant messages.
pub const PLACEHOLDER_TEXT: &str = "[user interrupted]";

/// Thinking content used when no earlier reasoning exists to copy.
pub const THINKING_PLACEHOLDER: &str = "[Continuing from previous reasoning]";

impl TranscriptStore {
    /// Ids of messages the provider would reject as empty.
    ///
    /// The final message is skipped when it is an assistant message: it may
    /// still be streaming and providers accept a trailing empty turn.
    pub fn find_empty_messages(&self, session_id: &SessionId) -> Result<Vec<MessageId>, StoreError> {
        let messages = self.list_messages(session_id)?;
        let last_index = messages.len().checked_sub(1);
        Ok(messages
            .iter()
            .enumerate()
            .filter(|(i, message)| {
                !message.has_content() && !(Some(*i) == last_index && message.is_assistant())
            })
            .map(|(_, message)| message.info.id.clone())
            .collect())
    }

    /// The empty message a provider error pointed at.
    ///
    /// Provider indices count from the start of the request, which can differ
    /// by one from the stored transcript, so the neighbours are tried too.
    pub fn find_empty_message_by_index(
        &self,
        session_id: &SessionId,
        index: usize,
    ) -> Result<Option<MessageId>, StoreError> {
        let messages = self.list_messages(session_id)?;
        let candidates = [Some(index), index.checked_sub(1), index.checked_add(1)];
        Ok(candidates
            .into_iter()
            .flatten()
            .filter_map(|i| messages.get(i))
            .find(|message| !message.has_content())
            .map(|message| message.info.id.clone()))
    }

    pub fn find_message_by_index(
        &self,
        session_id: &SessionId,
        index: usize,
    ) -> Result<Option<PersistedMessage>, StoreError> {
        Ok(self.list_messages(session_id)?.into_iter().nth(index))
    }

    pub fn find_messages_with_thinking_blocks(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.find_assistant_messages(session_id, PersistedMessage::has_thinking)
    }

    pub fn find_messages_with_thinking_only(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.find_assistant_messages(session_id, PersistedMessage::is_thinking_only)
    }

    /// Assistant messages with parts whose first part is not thinking.
    pub fn find_messages_with_orphan_thinking(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.find_assistant_messages(session_id, |message| {
            !message.parts.is_empty() && !message.starts_with_thinking()
        })
    }

    pub fn last_assistant(&self, session_id: &SessionId) -> Result<Option<PersistedMessage>, StoreError> {
        Ok(self
            .list_messages(session_id)?
            .into_iter()
            .rev()
            .find(PersistedMessage::is_assistant))
    }

    /// Text of the most recent thinking part before `before`.
    pub fn find_last_thinking_content(
        &self,
        session_id: &SessionId,
        before: &MessageId,
    ) -> Result<Option<String>, StoreError> {
        let messages = self.list_messages(session_id)?;
        Ok(messages
            .iter()
            .take_while(|message| &message.info.id != before)
            .flat_map(|message| message.parts.iter())
            .filter_map(|part| match &part.kind {
                PartKind::Thinking { text } if !text.trim().is_empty() => Some(text.clone()),
                _ => None,
            })
            .last())
    }

    fn find_assistant_messages(
        &self,
        session_id: &SessionId,
        predicate: impl Fn(&PersistedMessage) -> bool,
    ) -> Result<Vec<MessageId>, StoreError> {
        Ok(self
            .list_messages(session_id)?
            .iter()
            .filter(|message| message.is_assistant() && predicate(message))
            .map(|message| message.info.id.clone())
            .collect())
    }

    /// Rewrite every blank text part of a message to `placeholder`.
    pub fn replace_empty_text_parts(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        placeholder: &str,
    ) -> bool {
        let Some(message) = self.load_for_repair(session_id, message_id) else {
            return false;
        };

        let mut replaced = false;
        for mut part in message.parts {
            let PartKind::Text { text, synthetic } = &mut part.kind else {
                continue;
            };
            if !text.trim().is_empty() {
                continue;
            }
            *text = placeholder.to_string();
            *synthetic = true;
            if self.persist_repair(&part) {
                replaced = true;
            }
        }
        if replaced {
            debug!(session = %session_id, message = %message_id, "Replaced empty text parts");
        }
        replaced
    }

    /// Add a placeholder text part after the existing parts of a message that
    /// has no non-empty text. Messages with text are left alone.
    pub fn inject_text_part(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        placeholder: &str,
    ) -> bool {
        let Some(message) = self.load_for_repair(session_id, message_id) else {
            return false;
        };
        let has_text = message.parts.iter().any(|part| {
            matches!(&part.kind, PartKind::Text { text, .. } if !text.trim().is_empty())
        });
        if has_text {
            return false;
        }

        let id = match message.parts.last() {
            Some(last) => id_after(&last.id),
            None => PartId::new(format!("prt_{}_text", message_id.as_str())),
        };
        let part = Part::new(
            id,
            session_id.clone(),
            message_id.clone(),
            PartKind::Text {
                text: placeholder.to_string(),
                synthetic: true,
            },
        );
        let injected = self.persist_repair(&part);
        if injected {
            debug!(session = %session_id, message = %message_id, part = %part.id, "Injected placeholder text part");
        }
        injected
    }

    /// Insert a thinking part at the front of a message.
    ///
    /// The content is copied from the latest earlier thinking part when one
    /// exists. A message that already starts with thinking is untouched.
    pub fn prepend_thinking_part(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        let Some(message) = self.load_for_repair(session_id, message_id) else {
            return false;
        };
        if message.starts_with_thinking() {
            return false;
        }

        let content = match self.find_last_thinking_content(session_id, message_id) {
            Ok(Some(text)) => text,
            Ok(None) => THINKING_PLACEHOLDER.to_string(),
            Err(err) => {
                warn!(session = %session_id, "Failed to read earlier thinking: {err}");
                THINKING_PLACEHOLDER.to_string()
            }
        };
        let id = match message.parts.first() {
            Some(first) => id_before(&first.id),
            None => PartId::new("prt_!thinking"),
        };
        let part = Part::new(
            id,
            session_id.clone(),
            message_id.clone(),
            PartKind::thinking(content),
        );
        let prepended = self.persist_repair(&part);
        if prepended {
            debug!(session = %session_id, message = %message_id, "Prepended thinking part");
        }
        prepended
    }

    /// Delete every thinking part of a message.
    pub fn strip_thinking_parts(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        let Some(message) = self.load_for_repair(session_id, message_id) else {
            return false;
        };

        let mut stripped = false;
        for part in message.parts.iter().filter(|part| part.kind.is_thinking()) {
            match self.delete_part(message_id, &part.id) {
                Ok(removed) => stripped |= removed,
                Err(err) => warn!(part = %part.id, "Failed to strip thinking part: {err}"),
            }
        }
        if stripped {
            debug!(session = %session_id, message = %message_id, "Stripped thinking parts");
        }
        stripped
    }

    fn load_for_repair(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Option<PersistedMessage> {
        match self.read_message(session_id, message_id) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, message = %message_id, "Failed to load message for repair: {err}");
                None
            }
        }
    }

    fn persist_repair(&self, part: &Part) -> bool {
        match self.write_part(part) {
            Ok(()) => true,
            Err(err) => {
                warn!(part = %part.id, "Failed to persist repaired part: {err}");
                false
            }
        }
    }
}

/// Tool calls in `message` that never received a result anywhere in
/// `transcript`: `tool_use` parts without a matching `tool_result`, and combined
/// tool parts still pending or running.
#[must_use]
pub fn find_orphaned_tool_uses(message: &PersistedMessage, transcript: &[PersistedMessage]) -> Vec<String> {
    let answered: HashSet<&str> = transcript
        .iter()
        .flat_map(PersistedMessage::tool_result_ids)
        .collect();

    message
        .parts
        .iter()
        .filter_map(|part| match &part.kind {
            PartKind::ToolUse { tool_use_id, .. } if !answered.contains(tool_use_id.as_str()) => {
                Some(tool_use_id.clone())
            }
            PartKind::Tool { call_id, state, .. }
                if matches!(state.status, ToolStatus::Pending | ToolStatus::Running) =>
            {
                Some(call_id.clone())
            }
            _ => None,
        })
        .collect()
}

/// An id that sorts directly after `id`.
fn id_after(id: &PartId) -> PartId {
    PartId::new(format!("{}~text", id.as_str()))
}

/// An id that sorts before `id` and every sibling sharing its prefix.
///
/// Host ids look like `prt_<alphanumeric>`; `!` orders before any
/// alphanumeric character.
fn id_before(id: &PartId) -> PartId {
    let raw = id.as_str();
    let prefix = raw.find('_').map_or("", |at| &raw[..=at]);
    PartId::new(format!("{prefix}!thinking"))
}

//! Persisted transcript model.
//!
//! A transcript is an ordered list of [`PersistedMessage`]s, each owning an ordered
//! list of [`Part`]s. Part kinds form a closed sum type so the repair and pruning
//! engines match exhaustively; adding a kind is a compile-time-checked change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MessageId, ModelRef, PartId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Per-message metadata, stored as `message/<session>/<message>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: MessageId,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub role: Role,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    /// Raw provider error payload, exactly as the host delivered it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Set on assistant messages produced by a compaction (summary) pass.
    #[serde(default)]
    pub summary: bool,
    /// Tool permission overrides for this turn (`"write": false` revokes writes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, bool>,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
}

impl MessageInfo {
    #[must_use]
    pub fn new(id: impl Into<MessageId>, session_id: impl Into<SessionId>, role: Role) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            parent_id: None,
            error: None,
            agent: None,
            provider_id: None,
            model_id: None,
            summary: false,
            tools: BTreeMap::new(),
            created_at: 0,
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: &ModelRef) -> Self {
        self.provider_id = Some(model.provider_id.clone());
        self.model_id = Some(model.model_id.clone());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_summary(mut self) -> Self {
        self.summary = true;
        self
    }

    #[must_use]
    pub fn with_tool_permission(mut self, tool: impl Into<String>, allowed: bool) -> Self {
        self.tools.insert(tool.into(), allowed);
        self
    }

    #[must_use]
    pub fn model(&self) -> Option<ModelRef> {
        match (&self.provider_id, &self.model_id) {
            (Some(provider), Some(model)) => Some(ModelRef::new(provider.clone(), model.clone())),
            _ => None,
        }
    }

    /// Whether this turn still allows file mutation.
    ///
    /// Both `write` and `edit` must not be explicitly disabled.
    #[must_use]
    pub fn allows_writes(&self) -> bool {
        self.tools.get("write") != Some(&false) && self.tools.get("edit") != Some(&false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Millisecond timestamp of the truncation that replaced `output`.
    #[serde(rename = "compactedAt", default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<i64>,
}

impl ToolState {
    #[must_use]
    pub fn completed(input: Value, output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Completed,
            input,
            output: Some(output.into()),
            error: None,
            compacted_at: None,
        }
    }

    #[must_use]
    pub fn errored(input: Value, error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            input,
            output: None,
            error: Some(error.into()),
            compacted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PartKind {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    #[serde(rename = "thinking", alias = "reasoning")]
    Thinking { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        #[serde(default)]
        content: String,
    },
    #[serde(rename = "tool")]
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        state: ToolState,
    },
    /// Turn boundary marker.
    #[serde(rename = "step-start")]
    StepStart,
}

impl PartKind {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: false,
        }
    }

    #[must_use]
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    #[must_use]
    pub fn is_thinking(&self) -> bool {
        matches!(self, Self::Thinking { .. })
    }

    /// Whether this part carries content the provider counts as non-empty.
    ///
    /// Thinking and step markers do not count.
    #[must_use]
    pub fn has_content(&self) -> bool {
        match self {
            Self::Text { text, .. } => !text.trim().is_empty(),
            Self::ToolUse { .. } | Self::ToolResult { .. } | Self::Tool { .. } => true,
            Self::Thinking { .. } | Self::StepStart => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "messageID")]
    pub message_id: MessageId,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    #[must_use]
    pub fn new(
        id: impl Into<PartId>,
        session_id: impl Into<SessionId>,
        message_id: impl Into<MessageId>,
        kind: PartKind,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            message_id: message_id.into(),
            kind,
        }
    }
}

/// A message together with its parts, in persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl PersistedMessage {
    #[must_use]
    pub fn new(info: MessageInfo, parts: Vec<Part>) -> Self {
        Self { info, parts }
    }

    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.info.role == Role::Assistant
    }

    #[must_use]
    pub fn has_content(&self) -> bool {
        self.parts.iter().any(|part| part.kind.has_content())
    }

    #[must_use]
    pub fn has_thinking(&self) -> bool {
        self.parts.iter().any(|part| part.kind.is_thinking())
    }

    /// Thinking parts present, but nothing the provider counts as content.
    #[must_use]
    pub fn is_thinking_only(&self) -> bool {
        self.has_thinking() && !self.has_content()
    }

    #[must_use]
    pub fn starts_with_thinking(&self) -> bool {
        self.parts
            .first()
            .is_some_and(|part| part.kind.is_thinking())
    }

    /// Concatenated text of all `text` parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match &part.kind {
                PartKind::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool-use ids issued by this message, in order.
    #[must_use]
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match &part.kind {
                PartKind::ToolUse { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match &part.kind {
                PartKind::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

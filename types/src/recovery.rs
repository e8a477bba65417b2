use std::fmt;

use serde::{Deserialize, Serialize};

/// What went wrong, as far as recovery is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryErrorKind {
    TokenLimitExceeded,
    NonEmptyContentViolation,
    ToolResultMissing,
    ThinkingBlockOrder,
    ThinkingDisabledViolation,
    Unknown,
}

impl RecoveryErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenLimitExceeded => "token_limit_exceeded",
            Self::NonEmptyContentViolation => "non_empty_content_violation",
            Self::ToolResultMissing => "tool_result_missing",
            Self::ThinkingBlockOrder => "thinking_block_order",
            Self::ThinkingDisabledViolation => "thinking_disabled_violation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RecoveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider error after classification.
///
/// Ephemeral: produced once by a classifier, consumed once by a recovery path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRecoveryError {
    pub kind: RecoveryErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<usize>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ParsedRecoveryError {
    #[must_use]
    pub fn new(kind: RecoveryErrorKind) -> Self {
        Self {
            kind,
            current_tokens: None,
            max_tokens: None,
            message_index: None,
            provider_id: None,
            model_id: None,
            request_id: None,
        }
    }

    /// Tokens that must go for the request to fit, if both sides are known.
    #[must_use]
    pub fn excess_tokens(&self) -> Option<u64> {
        match (self.current_tokens, self.max_tokens) {
            (Some(current), Some(max)) if max > 0 => Some(current.saturating_sub(max)),
            _ => None,
        }
    }
}

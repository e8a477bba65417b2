//! Provider error classification.
//!
//! Provider errors reach us in whatever shape the transport produced: a bare
//! string, an SDK exception serialised to JSON, an HTTP envelope with the real
//! message buried in a response body (sometimes base64-wrapped). Classification
//! first gathers every string that might hold the human-readable message, then
//! matches keywords and numeric patterns against them.
//!
//! Both entry points are pure: identical input always yields identical output.

use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;
use serde_json::Value;

use keel_types::{ParsedRecoveryError, RecoveryErrorKind};

use crate::model_limits::ModelRegistry;

/// Substrings (lowercase) that mark a token or content-length failure.
const TOKEN_LIMIT_KEYWORDS: &[&str] = &[
    "prompt is too long",
    "is too long",
    "context_length_exceeded",
    "max_tokens",
    "token limit",
    "context length",
    "too many tokens",
    "non-empty content",
];

const NON_EMPTY_CONTENT_MARKER: &str = "non-empty content";

/// Ordered: the first pattern that captures two integers wins.
static TOKEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(\d[\d,]*)\s*tokens?\s*>\s*(\d[\d,]*)\s*maximum",
        r"(?i)prompt.*?(\d[\d,]*).*?tokens.*?exceeds.*?(\d[\d,]*)",
        r"(?i)maximum context length is\s*(\d[\d,]*)\s*tokens.*?resulted in\s*(\d[\d,]*)",
        r"(?i)(\d[\d,]*).*?tokens.*?limit.*?(\d[\d,]*)",
        r"(?i)context.*?length.*?(\d[\d,]*).*?maximum.*?(\d[\d,]*)",
        r"(?i)max.*?context.*?(\d[\d,]*).*?but.*?(\d[\d,]*)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("token pattern is valid"))
    .collect()
});

static MESSAGE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"messages\.(\d+)").expect("message index pattern is valid"));

static REQUEST_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)request[_-]?id["']?\s*[:=]\s*["']?([A-Za-z0-9_-]+)"#)
        .expect("request id pattern is valid")
});

static EMBEDDED_BYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""bytes"\s*:\s*"([A-Za-z0-9+/=]+)""#).expect("bytes pattern is valid")
});

static EMBEDDED_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""message"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("message pattern is valid")
});

/// Token-limit classifier backed by a model registry.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    registry: ModelRegistry,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Classify a token/content-length failure.
    ///
    /// Returns `None` unless one of the gathered messages carries a token-limit
    /// keyword. Thinking-block ordering errors are never reported here even when
    /// they mention `max_tokens`; see [`detect_structural_error`].
    #[must_use]
    pub fn classify(
        &self,
        raw: &Value,
        provider_id: Option<&str>,
        model_id: Option<&str>,
    ) -> Option<ParsedRecoveryError> {
        let messages = gather_messages(raw);
        let lowered: Vec<String> = messages.iter().map(|m| m.to_ascii_lowercase()).collect();

        let matches_keyword = lowered
            .iter()
            .any(|m| TOKEN_LIMIT_KEYWORDS.iter().any(|k| m.contains(k)));
        if !matches_keyword || lowered.iter().any(|m| structural_kind(m).is_some()) {
            return None;
        }

        let kind = if lowered.iter().any(|m| m.contains(NON_EMPTY_CONTENT_MARKER)) {
            RecoveryErrorKind::NonEmptyContentViolation
        } else {
            RecoveryErrorKind::TokenLimitExceeded
        };

        let mut parsed = ParsedRecoveryError::new(kind);
        parsed.provider_id = provider_id.map(ToString::to_string);
        parsed.model_id = model_id.map(ToString::to_string);
        parsed.message_index = messages.iter().find_map(|m| message_index(m));
        parsed.request_id = request_id(raw, &messages);

        if let Some((current, max)) = messages.iter().find_map(|m| token_pair(m)) {
            parsed.current_tokens = Some(current);
            parsed.max_tokens = Some(max);
        } else {
            let limit = match (provider_id, model_id) {
                (Some(provider), Some(model)) => self.registry.context_limit(provider, model),
                _ => None,
            };
            parsed.max_tokens = Some(u64::from(limit.unwrap_or(0)));
        }

        Some(parsed)
    }
}

/// Classify with the built-in model table.
#[must_use]
pub fn classify(
    raw: &Value,
    provider_id: Option<&str>,
    model_id: Option<&str>,
) -> Option<ParsedRecoveryError> {
    ErrorClassifier::default().classify(raw, provider_id, model_id)
}

/// Classify a transcript-shape violation (orphaned tool use, thinking order).
#[must_use]
pub fn detect_structural_error(raw: &Value) -> Option<ParsedRecoveryError> {
    let messages = gather_messages(raw);
    let kind = messages
        .iter()
        .find_map(|m| structural_kind(&m.to_ascii_lowercase()))?;

    let mut parsed = ParsedRecoveryError::new(kind);
    parsed.message_index = messages.iter().find_map(|m| message_index(m));
    parsed.request_id = request_id(raw, &messages);
    Some(parsed)
}

fn structural_kind(lowered: &str) -> Option<RecoveryErrorKind> {
    if lowered.contains("tool_use") && lowered.contains("tool_result") {
        return Some(RecoveryErrorKind::ToolResultMissing);
    }
    if lowered.contains("thinking")
        && (lowered.contains("first block")
            || lowered.contains("must start with")
            || lowered.contains("preceeding")
            || lowered.contains("preceding")
            || (lowered.contains("expected") && lowered.contains("found")))
    {
        return Some(RecoveryErrorKind::ThinkingBlockOrder);
    }
    if lowered.contains("thinking is disabled") && lowered.contains("cannot contain") {
        return Some(RecoveryErrorKind::ThinkingDisabledViolation);
    }
    None
}

/// Every string in `raw` that could plausibly hold the human-readable message.
///
/// Order: direct fields first, then messages extracted from embedded bodies,
/// then the raw bodies, and finally the whole payload serialised.
#[must_use]
pub fn gather_messages(raw: &Value) -> Vec<String> {
    let mut out = Vec::new();
    match raw {
        Value::String(text) => {
            out.push(text.clone());
            if let Some(extracted) = extract_from_body(text) {
                out.push(extracted);
            }
        }
        Value::Object(_) => {
            for pointer in [
                "/message",
                "/error/message",
                "/data/message",
                "/data/error/message",
                "/error",
                "/data/error",
            ] {
                if let Some(text) = raw.pointer(pointer).and_then(Value::as_str) {
                    out.push(text.to_string());
                }
            }
            for pointer in ["/responseBody", "/data/responseBody", "/body", "/data/body"] {
                if let Some(body) = raw.pointer(pointer).and_then(Value::as_str) {
                    if let Some(extracted) = extract_from_body(body) {
                        out.push(extracted);
                    }
                    out.push(body.to_string());
                }
            }
            out.push(raw.to_string());
        }
        Value::Null => {}
        other => out.push(other.to_string()),
    }
    out.dedup();
    out
}

/// Pull the provider's message out of a serialized response body.
///
/// Tried in priority order: JSON fields, a base64-embedded JSON event, a
/// `"message": "..."` pattern on bodies that are not valid JSON.
fn extract_from_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed)
        && let Some(message) = json_message(&parsed)
    {
        return Some(message);
    }

    if let Some(caps) = EMBEDDED_BYTES.captures(trimmed)
        && let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&caps[1])
        && let Ok(text) = String::from_utf8(decoded)
    {
        return serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|inner| json_message(&inner))
            .or(Some(text));
    }

    EMBEDDED_MESSAGE
        .captures(trimmed)
        .map(|caps| caps[1].replace("\\\"", "\""))
}

fn json_message(value: &Value) -> Option<String> {
    ["/error/message", "/message", "/Message", "/error"]
        .iter()
        .find_map(|pointer| value.pointer(pointer).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn token_pair(message: &str) -> Option<(u64, u64)> {
    TOKEN_PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(message)?;
        let a = parse_number(&caps[1])?;
        let b = parse_number(&caps[2])?;
        Some((a.max(b), a.min(b)))
    })
}

fn parse_number(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok().filter(|n| *n > 0)
}

fn message_index(message: &str) -> Option<usize> {
    MESSAGE_INDEX
        .captures(message)
        .and_then(|caps| caps[1].parse().ok())
}

fn request_id(raw: &Value, messages: &[String]) -> Option<String> {
    ["/requestID", "/requestId", "/data/requestID", "/data/requestId"]
        .iter()
        .find_map(|pointer| raw.pointer(pointer).and_then(Value::as_str))
        .map(ToString::to_string)
        .or_else(|| {
            messages
                .iter()
                .find_map(|m| REQUEST_ID.captures(m).map(|caps| caps[1].to_string()))
        })
}

//! Typed view over the host's lifecycle events.
//!
//! The host delivers `{ "type": ..., "properties": {...} }` bags whose shape
//! drifts between versions. [`HostEvent::from_value`] is total: anything it does
//! not recognise, including events without a session id, comes back as `None`.

use serde_json::Value;

use crate::{MessageId, MessageInfo, Role, SessionId};

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionError {
        session_id: SessionId,
        error: Option<Value>,
    },
    MessageUpdated {
        info: MessageInfo,
    },
    MessagePartUpdated {
        session_id: SessionId,
        message_id: Option<MessageId>,
        role: Option<Role>,
    },
    SessionIdle {
        session_id: SessionId,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    ToolExecuteBefore {
        session_id: SessionId,
        tool: String,
        call_id: Option<String>,
    },
    ToolExecuteAfter {
        session_id: SessionId,
        tool: String,
        call_id: Option<String>,
    },
}

impl HostEvent {
    #[must_use]
    pub fn from_value(event: &Value) -> Option<Self> {
        let kind = event.get("type")?.as_str()?;
        let props = event.get("properties").unwrap_or(&Value::Null);

        match kind {
            "session.error" => Some(Self::SessionError {
                session_id: session_id_of(props)?,
                error: props.get("error").filter(|e| !e.is_null()).cloned(),
            }),
            "message.updated" => {
                let info = serde_json::from_value(props.get("info")?.clone()).ok()?;
                Some(Self::MessageUpdated { info })
            }
            "message.part.updated" => {
                let info = props.get("info");
                let part = props.get("part");
                let session_id = info
                    .and_then(session_id_of)
                    .or_else(|| part.and_then(session_id_of))?;
                let message_id = part
                    .and_then(|p| p.get("messageID"))
                    .and_then(Value::as_str)
                    .map(MessageId::new);
                let role = info
                    .and_then(|i| i.get("role"))
                    .or_else(|| props.get("role"))
                    .and_then(|r| serde_json::from_value(r.clone()).ok());
                Some(Self::MessagePartUpdated {
                    session_id,
                    message_id,
                    role,
                })
            }
            "session.idle" => Some(Self::SessionIdle {
                session_id: session_id_of(props)?,
            }),
            "session.deleted" => {
                let session_id = props
                    .get("info")
                    .and_then(|info| info.get("id"))
                    .and_then(Value::as_str)
                    .map(SessionId::new)
                    .or_else(|| session_id_of(props))?;
                Some(Self::SessionDeleted { session_id })
            }
            "tool.execute.before" | "tool.execute.after" => {
                let session_id = session_id_of(props)?;
                let tool = props
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let call_id = props
                    .get("callID")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                if kind == "tool.execute.before" {
                    Some(Self::ToolExecuteBefore {
                        session_id,
                        tool,
                        call_id,
                    })
                } else {
                    Some(Self::ToolExecuteAfter {
                        session_id,
                        tool,
                        call_id,
                    })
                }
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionError { session_id, .. }
            | Self::MessagePartUpdated { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionDeleted { session_id }
            | Self::ToolExecuteBefore { session_id, .. }
            | Self::ToolExecuteAfter { session_id, .. } => session_id,
            Self::MessageUpdated { info } => &info.session_id,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionError { .. } => "session.error",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::SessionIdle { .. } => "session.idle",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::ToolExecuteBefore { .. } => "tool.execute.before",
            Self::ToolExecuteAfter { .. } => "tool.execute.after",
        }
    }
}

fn session_id_of(value: &Value) -> Option<SessionId> {
    value
        .get("sessionID")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(SessionId::new)
}

/// The `name` field of a host error payload, if present.
#[must_use]
pub fn error_name(error: &Value) -> Option<&str> {
    error.get("name").and_then(Value::as_str)
}

/// Whether the payload describes a user- or host-initiated abort.
#[must_use]
pub fn is_abort_error(error: &Value) -> bool {
    if matches!(
        error_name(error),
        Some("MessageAbortedError" | "AbortError")
    ) {
        return true;
    }
    let message = error
        .pointer("/data/message")
        .or_else(|| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    message.contains("aborted")
}

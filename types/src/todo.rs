use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    #[serde(default)]
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: Option<String>,
}

impl Todo {
    #[must_use]
    pub fn new(id: impl Into<String>, content: impl Into<String>, status: TodoStatus) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            status,
            priority: None,
        }
    }
}

/// Counts used by the continuation nudge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TodoProgress {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
}

impl TodoProgress {
    #[must_use]
    pub fn of(todos: &[Todo]) -> Self {
        let remaining = todos.iter().filter(|t| !t.status.is_terminal()).count();
        let completed = todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        Self {
            total: todos.len(),
            completed,
            remaining,
        }
    }

    #[must_use]
    pub fn has_incomplete(&self) -> bool {
        self.remaining > 0
    }
}

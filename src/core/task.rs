//! Task model shared by the store, the cycle executor and the HTTP surface.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DaemonError;
use super::schedule::RecurringRule;

/// Stable task identifier assigned by the store.
pub type TaskId = i64;

/// Opaque key-value bag passed unmodified to the agent executor.
pub type TaskContext = serde_json::Map<String, serde_json::Value>;

/// Default priority for submitted tasks.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a cycle.
    Pending,
    /// Claimed by a cycle; a unit owns it.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Storage and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DaemonError::InvalidTask(format!("unknown status `{s}`")))
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// Short description of the work.
    pub title: String,
    /// Full instructions for the agent.
    pub description: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Higher runs first within a cycle.
    pub priority: i32,
    /// Earliest time the task may run; `None` means immediately.
    pub due_at: Option<DateTime<Utc>>,
    /// Recurrence rule, if the task repeats.
    pub recurring_rule: Option<RecurringRule>,
    /// Terminal success payload.
    pub result: Option<String>,
    /// Terminal failure payload.
    pub error: Option<String>,
    /// Opaque collaborator context.
    pub context: TaskContext,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When a cycle claimed the task.
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal state was written.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a cancel arrives while the task is running.
    pub cancel_requested: bool,
    /// Recurrence successor, once materialised.
    pub successor_id: Option<TaskId>,
}

impl Task {
    /// Whether `list_due(now)` would return this task.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.due_at.is_none_or(|due| due <= now)
    }
}

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    /// Required, non-empty after trimming.
    pub title: String,
    /// Optional free text.
    #[serde(default)]
    pub description: String,
    /// Defaults to [`DEFAULT_PRIORITY`].
    #[serde(default)]
    pub priority: Option<i32>,
    /// Optional earliest start.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Optional rule text; validated before insert.
    #[serde(default)]
    pub recurring_rule: Option<String>,
    /// Optional collaborator context.
    #[serde(default)]
    pub context: TaskContext,
}

impl NewTask {
    /// Start a task with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the due time.
    #[must_use]
    pub const fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    /// Set the recurrence rule text.
    #[must_use]
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.recurring_rule = Some(rule.into());
        self
    }

    /// Insert a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Validate and normalise into the form the store persists.
    pub fn validate(self) -> Result<ValidatedTask, DaemonError> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(DaemonError::InvalidTask("title must not be empty".into()));
        }
        let recurring_rule = self
            .recurring_rule
            .as_deref()
            .map(str::parse::<RecurringRule>)
            .transpose()?;
        Ok(ValidatedTask {
            title,
            description: self.description,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            due_at: self.due_at,
            recurring_rule,
            context: self.context,
        })
    }
}

/// A [`NewTask`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedTask {
    /// Trimmed title.
    pub title: String,
    /// Description.
    pub description: String,
    /// Priority.
    pub priority: i32,
    /// Due time.
    pub due_at: Option<DateTime<Utc>>,
    /// Parsed rule.
    pub recurring_rule: Option<RecurringRule>,
    /// Context.
    pub context: TaskContext,
}

impl ValidatedTask {
    /// Successor of a recurring task, due at `due_at`.
    pub fn successor_of(task: &Task, due_at: DateTime<Utc>) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
            due_at: Some(due_at),
            recurring_rule: task.recurring_rule,
            context: task.context.clone(),
        }
    }
}

/// What kind of line a transcript entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    /// Text produced by the agent.
    AgentText,
    /// A tool invocation.
    ToolUse,
    /// A note written by the daemon itself.
    System,
}

impl TranscriptKind {
    /// Storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentText => "agent_text",
            Self::ToolUse => "tool_use",
            Self::System => "system",
        }
    }
}

impl FromStr for TranscriptKind {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_text" => Ok(Self::AgentText),
            "tool_use" => Ok(Self::ToolUse),
            "system" => Ok(Self::System),
            other => Err(DaemonError::Store(format!("unknown transcript kind `{other}`"))),
        }
    }
}

/// One line of a task's execution transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Position within the task's transcript, starting at 1.
    pub seq: u32,
    /// Entry kind.
    pub kind: TranscriptKind,
    /// Text or tool name.
    pub content: String,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A pending task moved straight to `cancelled`.
    Cancelled,
    /// A running task was flagged; its unit must be signalled.
    Signalled,
    /// The task is already terminal.
    NotCancellable(TaskStatus),
}

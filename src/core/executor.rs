//! Agent executor collaborator interface.
//!
//! The daemon never talks to an LLM provider directly. Each task is handed to
//! an [`AgentExecutor`], which streams [`Progress`] while it works and returns
//! an [`ExecutionOutcome`]. Which executor runs a task is decided by
//! [`ExecutorRegistry::select`], a pure function of the task context.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use agent_daemon::core::{
//!     AgentExecutor, DaemonError, ExecutionOutcome, ExecutionRequest, ProgressSink,
//! };
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AgentExecutor for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         request: ExecutionRequest,
//!         progress: ProgressSink,
//!     ) -> Result<ExecutionOutcome, DaemonError> {
//!         progress.agent_text(format!("working on {}", request.title));
//!         Ok(ExecutionOutcome::Completed { result: request.description })
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::DaemonError;
use super::task::{TaskContext, TaskId};
use crate::infra::store::TaskStore;

/// Context keys consulted, in order, when picking an executor.
pub const SELECTION_KEYS: [&str; 2] = ["executor", "provider"];

/// Intermediate progress reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Text produced by the agent.
    AgentText(String),
    /// The agent invoked a tool.
    ToolUse(String),
}

/// Non-blocking channel for executor progress. Every message also resets the
/// task's inactivity timer.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressSink {
    /// Create a sink and the receiver the cycle drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report agent text.
    pub fn agent_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Progress::AgentText(text.into()));
    }

    /// Report a tool invocation.
    pub fn tool_use(&self, tool: impl Into<String>) {
        let _ = self.tx.send(Progress::ToolUse(tool.into()));
    }
}

/// Lets an executor write the task's terminal state itself.
///
/// Writes are idempotent: whichever of the executor and the cycle's
/// reconciliation step lands first wins.
#[derive(Clone)]
pub struct TaskReporter {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
}

impl TaskReporter {
    /// Reporter bound to one task.
    pub fn new(store: Arc<dyn TaskStore>, task_id: TaskId) -> Self {
        Self { store, task_id }
    }

    /// Mark the task completed. `Ok(false)` if it was already terminal.
    pub fn complete(&self, result: &str) -> Result<bool, DaemonError> {
        self.store.complete(self.task_id, result)
    }

    /// Mark the task failed. `Ok(false)` if it was already terminal.
    pub fn fail(&self, error: &str) -> Result<bool, DaemonError> {
        self.store.fail(self.task_id, error)
    }
}

impl fmt::Debug for TaskReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskReporter")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// Everything an executor gets to know about a task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Task id.
    pub task_id: TaskId,
    /// Cycle the unit belongs to.
    pub cycle_id: Uuid,
    /// Title.
    pub title: String,
    /// Instructions.
    pub description: String,
    /// Priority.
    pub priority: i32,
    /// Opaque context, unmodified.
    pub context: TaskContext,
    /// Explicit completion channel.
    pub reporter: TaskReporter,
}

/// Terminal signal returned by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Work succeeded with a result.
    Completed {
        /// Result text.
        result: String,
    },
    /// Work failed.
    Failed {
        /// Error text.
        error: String,
    },
    /// The executor returned without saying how it went.
    Unreported,
}

/// Runs one task on behalf of the daemon.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Run the task, streaming progress into `progress`.
    ///
    /// The future may be dropped at any await point when a timeout or a
    /// cancellation fires.
    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> Result<ExecutionOutcome, DaemonError>;
}

/// Named executors plus a default.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn AgentExecutor>>,
    default: String,
}

impl ExecutorRegistry {
    /// Registry whose fallback is `default`; that name must be registered
    /// before tasks run.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            executors: BTreeMap::new(),
            default: default.into(),
        }
    }

    /// Registry with a single executor that is also the default.
    pub fn single(executor: Arc<dyn AgentExecutor>) -> Self {
        Self::new(executor.name().to_string()).with(executor)
    }

    /// Add or replace an executor under its own name.
    #[must_use]
    pub fn with(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executors.insert(executor.name().to_string(), executor);
        self
    }

    /// Registered names.
    pub fn names(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }

    /// Fallback executor name.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Name requested by a task context, if any.
    pub fn requested_name(context: &TaskContext) -> Option<&str> {
        SELECTION_KEYS
            .iter()
            .find_map(|key| context.get(*key).and_then(serde_json::Value::as_str))
    }

    /// Pick the executor for a task context.
    pub fn select(&self, context: &TaskContext) -> Result<Arc<dyn AgentExecutor>, DaemonError> {
        let name = Self::requested_name(context).unwrap_or(self.default.as_str());
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::Collaborator(format!("no executor named `{name}`")))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .field("default", &self.default)
            .finish()
    }
}

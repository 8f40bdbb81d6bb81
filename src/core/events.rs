//! Lifecycle events and their fan-out to live subscribers.
//!
//! Events are best effort. [`EventBroadcaster::publish`] never waits: each
//! subscriber reads from its own window of the last `capacity` events, and a
//! subscriber that falls behind loses the oldest ones without affecting the
//! publisher or anyone else. Nothing is persisted; the task store stays the
//! source of truth for terminal state.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::scheduler::{DaemonState, WakeReason};
use super::task::{TaskId, TaskStatus};

/// Maximum characters of agent text carried in a single event.
pub const EVENT_TEXT_LIMIT: usize = 500;

/// A timestamped event as sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonEvent {
    /// When the event was published.
    pub time: DateTime<Utc>,
    /// Payload, tagged by `type` on the wire.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First frame on a new stream.
    Connected {
        /// Daemon state at subscription time.
        state: DaemonState,
        /// Tasks running at subscription time.
        running_task_ids: Vec<TaskId>,
    },
    /// A cycle began.
    CycleStart {
        /// Cycle identifier.
        cycle_id: Uuid,
        /// Why the loop woke.
        reason: WakeReason,
        /// Tasks in the due snapshot.
        due: usize,
    },
    /// A unit acquired its slot and is invoking the executor.
    TaskStart {
        /// Owning cycle.
        cycle_id: Uuid,
        /// Task id.
        task_id: TaskId,
        /// Task title.
        title: String,
        /// Selected executor.
        executor: String,
    },
    /// Text streamed by the agent.
    AgentText {
        /// Task id.
        task_id: TaskId,
        /// Text, truncated to [`EVENT_TEXT_LIMIT`] characters.
        text: String,
    },
    /// The agent invoked a tool.
    ToolUse {
        /// Task id.
        task_id: TaskId,
        /// Tool name.
        tool: String,
    },
    /// A unit finished with status `completed`.
    TaskEnd {
        /// Task id.
        task_id: TaskId,
        /// Task title.
        title: String,
        /// Stored terminal status.
        status: TaskStatus,
        /// Wall time of the unit.
        duration_ms: u64,
        /// Tool invocations observed.
        tools_used: u32,
        /// Result text, if any.
        summary: Option<String>,
    },
    /// A unit finished with status `failed` or `cancelled`.
    TaskError {
        /// Task id.
        task_id: TaskId,
        /// Task title.
        title: String,
        /// Stored terminal status.
        status: TaskStatus,
        /// Wall time of the unit.
        duration_ms: u64,
        /// Human-readable error.
        error: String,
    },
    /// A cycle finished.
    CycleEnd {
        /// Cycle identifier.
        cycle_id: Uuid,
        /// Why the loop woke.
        reason: WakeReason,
        /// Units launched.
        tasks_launched: usize,
        /// Tool invocations across all units.
        tools_used: u32,
        /// Wall time of the cycle.
        duration_ms: u64,
        /// Recurrence successors created.
        rescheduled: usize,
    },
    /// A cycle could not run.
    CycleError {
        /// Cycle identifier.
        cycle_id: Uuid,
        /// What went wrong.
        error: String,
    },
}

impl EventKind {
    /// Wire name of the event type.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::CycleStart { .. } => "cycle_start",
            Self::TaskStart { .. } => "task_start",
            Self::AgentText { .. } => "agent_text",
            Self::ToolUse { .. } => "tool_use",
            Self::TaskEnd { .. } => "task_end",
            Self::TaskError { .. } => "task_error",
            Self::CycleEnd { .. } => "cycle_end",
            Self::CycleError { .. } => "cycle_error",
        }
    }

    /// Task the event belongs to, if any.
    pub const fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskStart { task_id, .. }
            | Self::AgentText { task_id, .. }
            | Self::ToolUse { task_id, .. }
            | Self::TaskEnd { task_id, .. }
            | Self::TaskError { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

impl DaemonEvent {
    /// Stamp a payload with the current time.
    pub fn now(kind: EventKind) -> Self {
        Self {
            time: Utc::now(),
            kind,
        }
    }
}

/// Fan-out hub for [`DaemonEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBroadcaster {
    /// Create a broadcaster where each subscriber buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Never blocks.
    pub fn publish(&self, kind: EventKind) {
        // An error only means nobody is listening.
        let _ = self.tx.send(DaemonEvent::now(kind));
    }

    /// Raw receiver; lag surfaces as `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream that silently skips over dropped events.
    pub fn stream(&self) -> impl Stream<Item = DaemonEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(
            |item: Result<DaemonEvent, BroadcastStreamRecvError>| match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged; oldest events dropped");
                    None
                }
            },
        )
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

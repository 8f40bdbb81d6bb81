//! Durable task storage.
//!
//! [`TaskStore`] is the single source of truth for what is due. Every
//! mutation is atomic with respect to concurrent callers: implementations
//! serialise writers behind one lock, so `claim` returning `false` reliably
//! means another caller won the race.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::core::{
    CancelOutcome, DaemonError, NewTask, Task, TaskId, TaskStatus, TranscriptEntry,
    TranscriptKind,
};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

/// Default page size for [`TaskStore::list`].
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Storage backend for tasks and their transcripts.
pub trait TaskStore: Send + Sync {
    /// Insert a `pending` task. Fails on a blank title or malformed rule.
    fn add(&self, task: NewTask) -> Result<TaskId, DaemonError>;

    /// Fetch one task.
    fn get(&self, id: TaskId) -> Result<Option<Task>, DaemonError>;

    /// Newest tasks first, optionally filtered by status.
    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>, DaemonError>;

    /// Pending tasks due at `now`, highest priority first, then earliest due
    /// date (undated first), then id. Never returns `in_progress` tasks.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError>;

    /// Pending tasks dated after `now`, soonest first.
    fn list_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError>;

    /// Atomically move `pending` to `in_progress`. `false` if someone else won.
    fn claim(&self, id: TaskId) -> Result<bool, DaemonError>;

    /// Terminal success write. `false` if the task was already terminal.
    fn complete(&self, id: TaskId, result: &str) -> Result<bool, DaemonError>;

    /// Terminal failure write. `false` if the task was already terminal.
    fn fail(&self, id: TaskId, error: &str) -> Result<bool, DaemonError>;

    /// Cancel a pending task, or flag a running one for its unit to stop.
    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, DaemonError>;

    /// Terminal cancellation write used once a running unit has stopped.
    fn mark_cancelled(&self, id: TaskId, note: &str) -> Result<bool, DaemonError>;

    /// Earliest moment any pending task becomes due. Undated pending tasks
    /// count as due since their creation.
    fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DaemonError>;

    /// Materialise the successor of a finished recurring task.
    ///
    /// Returns `None` when the task has no rule, is not completed or failed,
    /// was cancelled, or already has a successor; calling twice is harmless.
    fn reschedule_recurring(&self, id: TaskId, now: DateTime<Utc>)
        -> Result<Option<Task>, DaemonError>;

    /// Number of tasks in every status, zero-filled.
    fn counts_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>, DaemonError>;

    /// Append one transcript line.
    fn append_transcript(
        &self,
        id: TaskId,
        kind: TranscriptKind,
        content: &str,
    ) -> Result<(), DaemonError>;

    /// Full transcript of a task in order.
    fn transcript(&self, id: TaskId) -> Result<Vec<TranscriptEntry>, DaemonError>;

    /// Fail every task left `in_progress` by a previous process.
    fn recover_interrupted(&self, note: &str) -> Result<Vec<TaskId>, DaemonError>;
}

/// Launch order within a cycle.
pub fn due_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.due_at, b.due_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.id.cmp(&b.id))
}

fn zeroed_counts() -> BTreeMap<TaskStatus, u64> {
    TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect()
}

//! In-memory task store for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{due_order, zeroed_counts, TaskStore};
use crate::core::{
    CancelOutcome, DaemonError, NewTask, Task, TaskId, TaskStatus, TranscriptEntry,
    TranscriptKind, ValidatedTask,
};
use crate::util::clock::now;

#[derive(Default)]
struct Inner {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
    transcripts: HashMap<TaskId, Vec<TranscriptEntry>>,
}

impl Inner {
    fn insert(&mut self, task: ValidatedTask, at: DateTime<Utc>) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            Task {
                id,
                title: task.title,
                description: task.description,
                status: TaskStatus::Pending,
                priority: task.priority,
                due_at: task.due_at,
                recurring_rule: task.recurring_rule,
                result: None,
                error: None,
                context: task.context,
                created_at: at,
                updated_at: at,
                started_at: None,
                finished_at: None,
                cancel_requested: false,
                successor_id: None,
            },
        );
        id
    }

    fn finish(&mut self, id: TaskId, status: TaskStatus, result: Option<&str>, error: Option<&str>) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        let at = now();
        task.status = status;
        task.result = result.map(str::to_string);
        task.error = error.map(str::to_string);
        task.finished_at = Some(at);
        task.updated_at = at;
        true
    }
}

/// Task store holding everything in a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn add(&self, task: NewTask) -> Result<TaskId, DaemonError> {
        let task = task.validate()?;
        Ok(self.inner.lock().insert(task, now()))
    }

    fn get(&self, id: TaskId) -> Result<Option<Task>, DaemonError> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>, DaemonError> {
        let inner = self.inner.lock();
        Ok(inner
            .tasks
            .values()
            .rev()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError> {
        let inner = self.inner.lock();
        let mut due: Vec<Task> = inner.tasks.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by(due_order);
        Ok(due)
    }

    fn list_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DaemonError> {
        let inner = self.inner.lock();
        let mut scheduled: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.due_at.is_some_and(|due| due > now))
            .cloned()
            .collect();
        scheduled.sort_by_key(|t| (t.due_at, t.id));
        Ok(scheduled)
    }

    fn claim(&self, id: TaskId) -> Result<bool, DaemonError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                let at = now();
                task.status = TaskStatus::InProgress;
                task.started_at = Some(at);
                task.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete(&self, id: TaskId, result: &str) -> Result<bool, DaemonError> {
        Ok(self.inner.lock().finish(id, TaskStatus::Completed, Some(result), None))
    }

    fn fail(&self, id: TaskId, error: &str) -> Result<bool, DaemonError> {
        Ok(self.inner.lock().finish(id, TaskStatus::Failed, None, Some(error)))
    }

    fn cancel(&self, id: TaskId) -> Result<CancelOutcome, DaemonError> {
        let mut inner = self.inner.lock();
        let status = inner.tasks.get(&id).ok_or(DaemonError::NotFound(id))?.status;
        match status {
            TaskStatus::Pending => {
                inner.finish(id, TaskStatus::Cancelled, None, Some("cancelled before start"));
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::InProgress => {
                if let Some(task) = inner.tasks.get_mut(&id) {
                    task.cancel_requested = true;
                    task.updated_at = now();
                }
                Ok(CancelOutcome::Signalled)
            }
            other => Ok(CancelOutcome::NotCancellable(other)),
        }
    }

    fn mark_cancelled(&self, id: TaskId, note: &str) -> Result<bool, DaemonError> {
        Ok(self.inner.lock().finish(id, TaskStatus::Cancelled, None, Some(note)))
    }

    fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DaemonError> {
        let inner = self.inner.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.due_at.unwrap_or(t.created_at))
            .min())
    }

    fn reschedule_recurring(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DaemonError> {
        let mut inner = self.inner.lock();
        let task = inner.tasks.get(&id).ok_or(DaemonError::NotFound(id))?;
        let Some(rule) = task.recurring_rule else {
            return Ok(None);
        };
        let finished = matches!(task.status, TaskStatus::Completed | TaskStatus::Failed);
        if !finished || task.cancel_requested || task.successor_id.is_some() {
            return Ok(None);
        }
        let successor = ValidatedTask::successor_of(task, rule.next_occurrence(now));
        let successor_id = inner.insert(successor, now);
        if let Some(task) = inner.tasks.get_mut(&id) {
            task.successor_id = Some(successor_id);
        }
        Ok(inner.tasks.get(&successor_id).cloned())
    }

    fn counts_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>, DaemonError> {
        let inner = self.inner.lock();
        let mut counts = zeroed_counts();
        for task in inner.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        Ok(counts)
    }

    fn append_transcript(
        &self,
        id: TaskId,
        kind: TranscriptKind,
        content: &str,
    ) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock();
        if !inner.tasks.contains_key(&id) {
            return Err(DaemonError::NotFound(id));
        }
        let lines = inner.transcripts.entry(id).or_default();
        let seq = u32::try_from(lines.len()).unwrap_or(u32::MAX).saturating_add(1);
        lines.push(TranscriptEntry {
            seq,
            kind,
            content: content.to_string(),
            created_at: now(),
        });
        Ok(())
    }

    fn transcript(&self, id: TaskId) -> Result<Vec<TranscriptEntry>, DaemonError> {
        Ok(self.inner.lock().transcripts.get(&id).cloned().unwrap_or_default())
    }

    fn recover_interrupted(&self, note: &str) -> Result<Vec<TaskId>, DaemonError> {
        let mut inner = self.inner.lock();
        let ids: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            inner.finish(*id, TaskStatus::Failed, None, Some(note));
        }
        Ok(ids)
    }
}

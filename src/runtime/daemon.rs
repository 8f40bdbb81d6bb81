//! Daemon wiring: store, scheduler loop and control surface under one
//! shutdown token.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AppResult, CancelOutcome, DaemonError, DaemonEvent, DaemonState, EventBroadcaster, EventKind,
    NewTask, RunningTask, SchedulerHandle, SchedulerLoop, Task, TaskId, TaskStatus,
    TranscriptEntry,
};
use crate::infra::store::TaskStore;
use crate::util::clock::now;

/// Effective settings echoed by `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    /// Longest sleep between cycles, in seconds.
    pub check_interval_secs: u64,
    /// Concurrent executor calls.
    pub max_concurrent_tasks: usize,
    /// Optional cap on tasks launched per cycle.
    pub max_tasks_per_cycle: Option<usize>,
    /// Wall-clock ceiling per task, in seconds.
    pub task_timeout_secs: u64,
    /// Ceiling on silence between progress events, in seconds.
    pub inactivity_timeout_secs: u64,
    /// Registered executors.
    pub executors: Vec<String>,
    /// Executor used when a task names none.
    pub default_executor: String,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Idle or running.
    pub state: DaemonState,
    /// Ids of tasks whose units are executing.
    pub running_task_ids: Vec<TaskId>,
    /// Details of the running tasks.
    pub running: Vec<RunningTask>,
    /// Task count per status.
    pub counts: BTreeMap<TaskStatus, u64>,
    /// When the last cycle finished.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Cycles run since start.
    pub cycles_completed: u64,
    /// When the scheduler started.
    pub started_at: DateTime<Utc>,
    /// When the current sleep ends, if sleeping.
    pub next_wake_at: Option<DateTime<Utc>>,
    /// Settings in effect.
    pub config: ConfigSummary,
}

/// A task with its transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    /// The task row.
    pub task: Task,
    /// Progress recorded while it ran.
    pub transcript: Vec<TranscriptEntry>,
}

/// Cloneable handle used by the control surface and embedders.
#[derive(Clone)]
pub struct DaemonHandle {
    store: Arc<dyn TaskStore>,
    scheduler: SchedulerHandle,
    events: EventBroadcaster,
    summary: Arc<ConfigSummary>,
    shutdown: CancellationToken,
    started: Instant,
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("config", &self.summary)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DaemonHandle {
    /// Store a new task and optionally trigger an immediate cycle.
    ///
    /// Without `wake_immediately`, a task due before the current sleep ends
    /// still shortens that sleep.
    pub fn submit(&self, task: NewTask, wake_immediately: bool) -> Result<Task, DaemonError> {
        let id = self.store.add(task)?;
        let task = self.require(id)?;
        tracing::info!(task_id = id, title = %task.title, priority = task.priority, "task added");
        if wake_immediately {
            self.scheduler.wake();
        } else if let Some(wake_at) = self.scheduler.snapshot().next_wake_at {
            if task.due_at.is_none_or(|due| due < wake_at) {
                self.scheduler.resize();
            }
        }
        Ok(task)
    }

    /// Trigger a cycle now.
    pub fn wake(&self) {
        tracing::info!("manual wake requested");
        self.scheduler.wake();
    }

    /// Scheduler state plus task counts.
    pub fn status(&self) -> Result<StatusReport, DaemonError> {
        let snapshot = self.scheduler.snapshot();
        Ok(StatusReport {
            state: snapshot.state,
            running_task_ids: snapshot.running_task_ids(),
            running: snapshot.running,
            counts: self.store.counts_by_status()?,
            last_cycle_at: snapshot.last_cycle_at,
            cycles_completed: snapshot.cycles_completed,
            started_at: snapshot.started_at,
            next_wake_at: snapshot.next_wake_at,
            config: (*self.summary).clone(),
        })
    }

    /// Newest tasks first.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>, DaemonError> {
        self.store.list(status, limit)
    }

    /// One task with its transcript.
    pub fn detail(&self, id: TaskId) -> Result<Option<TaskDetail>, DaemonError> {
        let Some(task) = self.store.get(id)? else {
            return Ok(None);
        };
        let transcript = self.store.transcript(id)?;
        Ok(Some(TaskDetail { task, transcript }))
    }

    /// Cancel a pending task or stop a running one.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, DaemonError> {
        let outcome = self.store.cancel(id)?;
        match outcome {
            CancelOutcome::Cancelled => tracing::info!(task_id = id, "pending task cancelled"),
            CancelOutcome::Signalled => self.scheduler.signal_cancel(id),
            CancelOutcome::NotCancellable(status) => {
                tracing::debug!(task_id = id, %status, "cancel refused");
            }
        }
        Ok(outcome)
    }

    /// Completion reported by an agent over the control surface.
    pub fn report_complete(&self, id: TaskId, result: &str) -> Result<bool, DaemonError> {
        let task = self.require(id)?;
        let applied = self.store.complete(id, result)?;
        self.after_report(&task, applied);
        Ok(applied)
    }

    /// Failure reported by an agent over the control surface.
    pub fn report_fail(&self, id: TaskId, error: &str) -> Result<bool, DaemonError> {
        let task = self.require(id)?;
        let applied = self.store.fail(id, error)?;
        self.after_report(&task, applied);
        Ok(applied)
    }

    /// A report can finish a task no cycle ever claimed, so the recurrence
    /// successor is created here too. The store links successors, so the
    /// cycle's own reschedule of a running task stays a no-op.
    fn after_report(&self, task: &Task, applied: bool) {
        if !applied || task.recurring_rule.is_none() {
            return;
        }
        match self.store.reschedule_recurring(task.id, now()) {
            Ok(Some(next)) => {
                tracing::info!(task_id = task.id, successor = next.id, "recurring task rescheduled after report");
                self.scheduler.resize();
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(task_id = task.id, error = %err, "reschedule after report failed"),
        }
    }

    /// Pending tasks dated in the future, soonest first.
    pub fn scheduled(&self) -> Result<Vec<Task>, DaemonError> {
        self.store.list_scheduled(now())
    }

    /// Tasks whose units are executing.
    pub fn running(&self) -> Vec<RunningTask> {
        self.scheduler.snapshot().running
    }

    /// Run one pending task now without waiting for a cycle.
    ///
    /// The task is claimed here, so it cannot also be picked up by a cycle
    /// or a second call. Its unit shares the concurrency limit with cycle
    /// units.
    pub fn execute_now(&self, id: TaskId) -> Result<Task, DaemonError> {
        let task = self.require(id)?;
        if task.status != TaskStatus::Pending {
            return Err(DaemonError::InvalidTask(format!(
                "task {id} is {}, not pending",
                task.status
            )));
        }
        if !self.store.claim(id)? {
            return Err(DaemonError::ClaimConflict(id));
        }
        let claimed = self.require(id)?;
        if !self.scheduler.execute(claimed.clone()) {
            self.store.fail(id, "interrupted by daemon shutdown before start")?;
            return Err(DaemonError::ShuttingDown);
        }
        tracing::info!(task_id = id, title = %claimed.title, "manual execution requested");
        Ok(claimed)
    }

    /// Live events, starting with a `connected` frame describing the
    /// current state. Ends when the daemon shuts down.
    pub fn event_stream(&self) -> impl Stream<Item = DaemonEvent> + Send + 'static {
        let live = self.events.stream();
        let snapshot = self.scheduler.snapshot();
        let connected = DaemonEvent::now(EventKind::Connected {
            state: snapshot.state,
            running_task_ids: snapshot.running_task_ids(),
        });
        futures::stream::once(async move { connected })
            .chain(live)
            .take_until(self.shutdown.clone().cancelled_owned())
    }

    /// Seconds since the daemon was built.
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Ask everything to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled when the daemon stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Underlying store.
    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    /// Underlying event hub.
    pub const fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Underlying scheduler handle.
    pub const fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    fn require(&self, id: TaskId) -> Result<Task, DaemonError> {
        self.store.get(id)?.ok_or(DaemonError::NotFound(id))
    }
}

/// A fully wired daemon that has not started yet.
pub struct Daemon {
    scheduler: SchedulerLoop,
    handle: DaemonHandle,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl Daemon {
    pub(crate) fn new(
        summary: ConfigSummary,
        store: Arc<dyn TaskStore>,
        events: EventBroadcaster,
        scheduler: SchedulerLoop,
        scheduler_handle: SchedulerHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            handle: DaemonHandle {
                store,
                scheduler: scheduler_handle,
                events,
                summary: Arc::new(summary),
                shutdown,
                started: Instant::now(),
            },
        }
    }

    /// Handle usable before and after start.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Spawn the scheduler loop. A fatal loop error cancels the shutdown
    /// token so the control surface stops too.
    pub fn start(self) -> (DaemonHandle, JoinHandle<Result<(), DaemonError>>) {
        let shutdown = self.handle.shutdown_token();
        let scheduler = self.scheduler;
        let task = tokio::spawn(async move {
            let result = scheduler.run().await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        });
        (self.handle, task)
    }

    /// Start the scheduler and serve the control surface on `listener`
    /// until shutdown.
    pub async fn serve(self, listener: TcpListener) -> AppResult<()> {
        let addr = listener.local_addr().context("reading listener address")?;
        let (handle, scheduler) = self.start();
        let app = super::api::router(handle.clone());
        let token = handle.shutdown_token();
        tracing::info!(%addr, "control surface listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("serving control surface")?;

        handle.shutdown();
        scheduler.await.context("scheduler task panicked")??;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

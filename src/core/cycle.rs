//! Cycle executor: runs one batch of due tasks to completion.
//!
//! A cycle snapshots the due list, claims every task in launch order, then
//! launches the claimed tasks one by one as they obtain a concurrency permit.
//! Each launched task runs as an independent unit on a [`JoinSet`]. A unit
//! owns the executor call, both timers, progress forwarding and the
//! safety-net write of the terminal state; it emits exactly one `task_end`
//! or `task_error` and never propagates a failure upward.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{DaemonError, TimeoutKind};
use super::events::{EventBroadcaster, EventKind, EVENT_TEXT_LIMIT};
use super::executor::{
    AgentExecutor, ExecutionOutcome, ExecutionRequest, ExecutorRegistry, Progress, ProgressSink,
    TaskReporter,
};
use super::scheduler::{RunningTask, WakeReason};
use super::task::{Task, TaskId, TaskStatus, TranscriptKind};
use crate::infra::store::TaskStore;
use crate::util::clock::now;
use crate::util::text::truncate_chars;

/// Maximum characters of joined agent text kept as an inferred result.
pub const SUMMARY_LIMIT: usize = 2000;
/// Maximum characters of a result carried in a `task_end` event.
pub const EVENT_SUMMARY_LIMIT: usize = 1000;

/// Knobs for the cycle executor.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Concurrent executor calls.
    pub max_concurrent_tasks: usize,
    /// Optional cap on tasks launched per cycle.
    pub max_tasks_per_cycle: Option<usize>,
    /// Wall-clock ceiling per task.
    pub task_timeout: Duration,
    /// Ceiling on silence between progress events.
    pub inactivity_timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_tasks_per_cycle: None,
            task_timeout: Duration::from_secs(3600),
            inactivity_timeout: Duration::from_secs(600),
        }
    }
}

/// Lifecycle notifications sent from units to the scheduler loop.
#[derive(Debug)]
pub enum UnitUpdate {
    /// A unit acquired its permit and is about to call its executor.
    Started {
        /// Task being run.
        task: RunningTask,
        /// Cancels this unit only.
        cancel: CancellationToken,
    },
    /// A unit wrote its terminal state.
    Finished {
        /// Task that finished.
        task_id: TaskId,
    },
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cycle identifier.
    pub cycle_id: Uuid,
    /// Units launched.
    pub launched: usize,
    /// Tool invocations across all units.
    pub tools_used: u32,
    /// Recurrence successors created.
    pub rescheduled: usize,
    /// Due tasks left for a later cycle by `max_tasks_per_cycle`.
    pub deferred: usize,
    /// Final status of each launched task, in launch order.
    pub outcomes: Vec<(TaskId, TaskStatus)>,
    /// Wall time.
    pub duration: Duration,
}

/// Runs cycles against a store, an executor registry and an event hub.
pub struct CycleExecutor {
    store: Arc<dyn TaskStore>,
    registry: ExecutorRegistry,
    events: EventBroadcaster,
    permits: Arc<Semaphore>,
    config: CycleConfig,
}

#[derive(Debug, Default)]
struct Tally {
    texts: Vec<String>,
    tools_used: u32,
}

enum Ending {
    Returned(Result<ExecutionOutcome, DaemonError>),
    TimedOut(TimeoutKind),
    Cancelled,
    Shutdown,
    Panicked(String),
}

enum Verdict {
    Complete(String),
    Fail(String),
    Cancel(String),
}

struct UnitReport {
    task_id: TaskId,
    status: TaskStatus,
    tools_used: u32,
    recurring: bool,
}

struct UnitContext {
    store: Arc<dyn TaskStore>,
    events: EventBroadcaster,
    updates: mpsc::UnboundedSender<UnitUpdate>,
    shutdown: CancellationToken,
    config: CycleConfig,
}

impl CycleExecutor {
    /// Create an executor with its own concurrency gate.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: ExecutorRegistry,
        events: EventBroadcaster,
        config: CycleConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            store,
            registry,
            events,
            permits,
            config,
        }
    }

    /// Configuration in use.
    pub const fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Executor registry in use.
    pub const fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run one cycle to completion.
    ///
    /// Only store failures while reading the due list or claiming escape as
    /// `Err`; everything that goes wrong inside a unit is recorded on the task.
    pub async fn run(
        &self,
        reason: WakeReason,
        updates: &mpsc::UnboundedSender<UnitUpdate>,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, DaemonError> {
        let cycle_id = Uuid::new_v4();
        let started = Instant::now();

        let mut due = match self.store.list_due(now()) {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(%cycle_id, error = %err, "cannot read due tasks");
                self.events.publish(EventKind::CycleError {
                    cycle_id,
                    error: err.to_string(),
                });
                return Err(err);
            }
        };
        let mut deferred = 0;
        if let Some(cap) = self.config.max_tasks_per_cycle {
            deferred = due.len().saturating_sub(cap);
            due.truncate(cap);
        }

        tracing::info!(%cycle_id, ?reason, due = due.len(), deferred, "cycle started");
        self.events.publish(EventKind::CycleStart {
            cycle_id,
            reason,
            due: due.len(),
        });

        let mut fatal = None;
        let mut claimed = Vec::with_capacity(due.len());
        for task in due {
            match self.store.claim(task.id) {
                Ok(true) => claimed.push(task),
                Ok(false) => {
                    tracing::debug!(
                        task_id = task.id,
                        error = %DaemonError::ClaimConflict(task.id),
                        "skipping task"
                    );
                }
                Err(err) if err.is_fatal() => {
                    fatal = Some(err);
                    break;
                }
                Err(err) => {
                    tracing::warn!(task_id = task.id, error = %err, "claim failed; task left for a later cycle");
                }
            }
        }

        let ctx = Arc::new(UnitContext {
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            updates: updates.clone(),
            shutdown: shutdown.clone(),
            config: self.config.clone(),
        });

        let mut units = JoinSet::new();
        let mut launched = Vec::new();
        for task in claimed {
            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
                () = shutdown.cancelled() => None,
            };
            let Some(permit) = permit else {
                abandon(&ctx, &task, "interrupted by daemon shutdown before start");
                continue;
            };
            if cancel_requested(self.store.as_ref(), task.id) {
                abandon(&ctx, &task, "cancelled before start");
                continue;
            }
            let (executor, executor_name) = self.executor_for(&task);
            let cancel = announce(&ctx, &task, executor_name, cycle_id);
            launched.push(task.id);
            units.spawn(run_unit(
                Arc::clone(&ctx),
                task,
                executor,
                cycle_id,
                cancel,
                permit,
            ));
        }

        let mut reports = Vec::with_capacity(launched.len());
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(%cycle_id, error = %err, "task unit aborted"),
            }
        }
        reports.sort_by_key(|r| launched.iter().position(|id| *id == r.task_id));

        let mut rescheduled = 0;
        for report in reports.iter().filter(|r| r.recurring) {
            match self.store.reschedule_recurring(report.task_id, now()) {
                Ok(Some(_)) => rescheduled += 1,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(task_id = report.task_id, error = %err, "reschedule failed");
                }
            }
        }

        let tools_used: u32 = reports.iter().map(|r| r.tools_used).sum();
        let duration = started.elapsed();

        if let Some(err) = fatal {
            tracing::error!(%cycle_id, error = %err, "cycle aborted");
            self.events.publish(EventKind::CycleError {
                cycle_id,
                error: err.to_string(),
            });
            return Err(err);
        }

        tracing::info!(
            %cycle_id,
            launched = launched.len(),
            tools_used,
            rescheduled,
            duration_ms = millis(duration),
            "cycle finished"
        );
        self.events.publish(EventKind::CycleEnd {
            cycle_id,
            reason,
            tasks_launched: launched.len(),
            tools_used,
            duration_ms: millis(duration),
            rescheduled,
        });

        Ok(CycleReport {
            cycle_id,
            launched: launched.len(),
            tools_used,
            rescheduled,
            deferred,
            outcomes: reports.iter().map(|r| (r.task_id, r.status)).collect(),
            duration,
        })
    }

    /// Run one task outside any cycle. The task must already be claimed.
    ///
    /// The returned future waits for a concurrency permit like any cycle
    /// unit, runs the unit, then creates the recurrence successor.
    pub fn launch(
        &self,
        task: Task,
        updates: &mpsc::UnboundedSender<UnitUpdate>,
        shutdown: &CancellationToken,
    ) -> impl std::future::Future<Output = TaskStatus> + Send + 'static {
        let ctx = Arc::new(UnitContext {
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            updates: updates.clone(),
            shutdown: shutdown.clone(),
            config: self.config.clone(),
        });
        let permits = Arc::clone(&self.permits);
        let (executor, executor_name) = self.executor_for(&task);
        let cycle_id = Uuid::new_v4();
        async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                () = ctx.shutdown.cancelled() => None,
            };
            let Some(permit) = permit else {
                return abandon(&ctx, &task, "interrupted by daemon shutdown before start");
            };
            if cancel_requested(ctx.store.as_ref(), task.id) {
                return abandon(&ctx, &task, "cancelled before start");
            }
            let cancel = announce(&ctx, &task, executor_name, cycle_id);
            let report = run_unit(Arc::clone(&ctx), task, executor, cycle_id, cancel, permit).await;
            if report.recurring {
                if let Err(err) = ctx.store.reschedule_recurring(report.task_id, now()) {
                    tracing::warn!(task_id = report.task_id, error = %err, "reschedule failed");
                }
            }
            report.status
        }
    }

    fn executor_for(&self, task: &Task) -> (Result<Arc<dyn AgentExecutor>, DaemonError>, String) {
        let executor = self.registry.select(&task.context);
        let name = executor.as_ref().map_or_else(
            |_| {
                ExecutorRegistry::requested_name(&task.context)
                    .unwrap_or(self.registry.default_name())
                    .to_string()
            },
            |e| e.name().to_string(),
        );
        (executor, name)
    }
}

fn cancel_requested(store: &dyn TaskStore, id: TaskId) -> bool {
    matches!(store.get(id), Ok(Some(task)) if task.cancel_requested)
}

/// Register a unit with the loop and emit `task_start`. Returns the token
/// that cancels this unit only.
fn announce(ctx: &UnitContext, task: &Task, executor: String, cycle_id: Uuid) -> CancellationToken {
    let cancel = ctx.shutdown.child_token();
    let _ = ctx.updates.send(UnitUpdate::Started {
        task: RunningTask {
            task_id: task.id,
            title: task.title.clone(),
            executor: executor.clone(),
            started_at: now(),
        },
        cancel: cancel.clone(),
    });
    tracing::info!(%cycle_id, task_id = task.id, executor = %executor, "task started");
    ctx.events.publish(EventKind::TaskStart {
        cycle_id,
        task_id: task.id,
        title: task.title.clone(),
        executor,
    });
    cancel
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Finish a claimed task that never reached its executor.
fn abandon(ctx: &UnitContext, task: &Task, note: &str) -> TaskStatus {
    let verdict = if ctx.shutdown.is_cancelled() {
        Verdict::Fail(note.to_string())
    } else {
        Verdict::Cancel(note.to_string())
    };
    finalize(ctx, task, &verdict, &Tally::default(), Duration::ZERO)
}

async fn run_unit(
    ctx: Arc<UnitContext>,
    task: Task,
    executor: Result<Arc<dyn AgentExecutor>, DaemonError>,
    cycle_id: Uuid,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> UnitReport {
    let started = Instant::now();
    let driven = match executor {
        Ok(executor) => {
            AssertUnwindSafe(drive(&ctx, &task, executor, cycle_id, &cancel))
                .catch_unwind()
                .await
        }
        Err(err) => Ok((Ending::Returned(Err(err)), Tally::default())),
    };
    let (ending, tally) = driven.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        (Ending::Panicked(message), Tally::default())
    });

    let verdict = reconcile(&ctx, task.id, ending, &tally);
    let status = finalize(&ctx, &task, &verdict, &tally, started.elapsed());
    let _ = ctx.updates.send(UnitUpdate::Finished { task_id: task.id });
    UnitReport {
        task_id: task.id,
        status,
        tools_used: tally.tools_used,
        recurring: task.recurring_rule.is_some(),
    }
}

async fn drive(
    ctx: &UnitContext,
    task: &Task,
    executor: Arc<dyn AgentExecutor>,
    cycle_id: Uuid,
    cancel: &CancellationToken,
) -> (Ending, Tally) {
    // A cancel that reached the loop before this unit's `Started` update
    // found nothing to signal; the store flag is already set by then.
    if cancel_requested(ctx.store.as_ref(), task.id) {
        return (Ending::Cancelled, Tally::default());
    }
    let (sink, mut progress) = ProgressSink::channel();
    let request = ExecutionRequest {
        task_id: task.id,
        cycle_id,
        title: task.title.clone(),
        description: task.description.clone(),
        priority: task.priority,
        context: task.context.clone(),
        reporter: TaskReporter::new(Arc::clone(&ctx.store), task.id),
    };
    let mut call = executor.execute(request, sink);
    let inactivity = ctx.config.inactivity_timeout;
    let wall = tokio::time::sleep(ctx.config.task_timeout);
    tokio::pin!(wall);
    let idle = tokio::time::sleep(inactivity);
    tokio::pin!(idle);

    let mut tally = Tally::default();
    let ending = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                break if ctx.shutdown.is_cancelled() { Ending::Shutdown } else { Ending::Cancelled };
            }
            Some(update) = progress.recv() => {
                idle.as_mut().reset(tokio::time::Instant::now() + inactivity);
                record(ctx, task.id, update, &mut tally);
            }
            outcome = &mut call => break Ending::Returned(outcome),
            () = &mut wall => break Ending::TimedOut(TimeoutKind::WallClock),
            () = &mut idle => break Ending::TimedOut(TimeoutKind::Inactivity),
        }
    };
    // Dropping the call cancels whatever the executor was still doing.
    drop(call);
    while let Ok(update) = progress.try_recv() {
        record(ctx, task.id, update, &mut tally);
    }
    (ending, tally)
}

fn record(ctx: &UnitContext, task_id: TaskId, update: Progress, tally: &mut Tally) {
    let (kind, content) = match &update {
        Progress::AgentText(text) => (TranscriptKind::AgentText, text.as_str()),
        Progress::ToolUse(tool) => (TranscriptKind::ToolUse, tool.as_str()),
    };
    if let Err(err) = ctx.store.append_transcript(task_id, kind, content) {
        tracing::warn!(task_id, error = %err, "transcript write failed");
    }
    match update {
        Progress::AgentText(text) => {
            ctx.events.publish(EventKind::AgentText {
                task_id,
                text: truncate_chars(&text, EVENT_TEXT_LIMIT),
            });
            tally.texts.push(text);
        }
        Progress::ToolUse(tool) => {
            tracing::debug!(task_id, tool = %tool, "tool use");
            ctx.events.publish(EventKind::ToolUse { task_id, tool });
            tally.tools_used += 1;
        }
    }
}

/// Decide the terminal state for a unit that ended without (or besides) an
/// explicit report from its executor.
fn reconcile(ctx: &UnitContext, task_id: TaskId, ending: Ending, tally: &Tally) -> Verdict {
    match ending {
        Ending::Returned(Ok(ExecutionOutcome::Completed { result })) => Verdict::Complete(result),
        Ending::Returned(Ok(ExecutionOutcome::Failed { error })) => Verdict::Fail(error),
        Ending::Returned(Ok(ExecutionOutcome::Unreported)) => {
            if tally.texts.is_empty() {
                Verdict::Fail(DaemonError::UnreconciledTask(task_id).to_string())
            } else {
                Verdict::Complete(truncate_chars(&tally.texts.join("\n"), SUMMARY_LIMIT))
            }
        }
        Ending::Returned(Err(err)) => Verdict::Fail(match err {
            DaemonError::Collaborator(_) => err.to_string(),
            other => DaemonError::Collaborator(other.to_string()).to_string(),
        }),
        Ending::TimedOut(kind) => {
            let limit = match kind {
                TimeoutKind::WallClock => ctx.config.task_timeout,
                TimeoutKind::Inactivity => ctx.config.inactivity_timeout,
            };
            Verdict::Fail(DaemonError::ExecutionTimeout { kind, limit }.to_string())
        }
        Ending::Cancelled => Verdict::Cancel("cancelled while running".to_string()),
        Ending::Shutdown => Verdict::Fail("interrupted by daemon shutdown".to_string()),
        Ending::Panicked(message) => {
            Verdict::Fail(DaemonError::Collaborator(format!("executor panicked: {message}")).to_string())
        }
    }
}

/// Write the verdict (a no-op if the executor already reported), then emit
/// the single terminal event from whatever the store now holds.
fn finalize(
    ctx: &UnitContext,
    task: &Task,
    verdict: &Verdict,
    tally: &Tally,
    elapsed: Duration,
) -> TaskStatus {
    let id = task.id;
    let (written, note) = match verdict {
        Verdict::Complete(result) => (ctx.store.complete(id, result), None),
        Verdict::Fail(error) => (ctx.store.fail(id, error), Some(error.as_str())),
        Verdict::Cancel(note) => (ctx.store.mark_cancelled(id, note), Some(note.as_str())),
    };
    match written {
        Ok(true) => {
            if let Some(note) = note {
                let _ = ctx.store.append_transcript(id, TranscriptKind::System, note);
            }
        }
        Ok(false) => tracing::debug!(task_id = id, "terminal state already reported"),
        Err(err) => tracing::error!(task_id = id, error = %err, "terminal write failed"),
    }

    let stored = ctx.store.get(id).ok().flatten().filter(|t| t.status.is_terminal());
    let (status, result, error) = match (stored, verdict) {
        (Some(t), _) => (t.status, t.result, t.error),
        (None, Verdict::Complete(r)) => (TaskStatus::Completed, Some(r.clone()), None),
        (None, Verdict::Fail(e)) => (TaskStatus::Failed, None, Some(e.clone())),
        (None, Verdict::Cancel(n)) => (TaskStatus::Cancelled, None, Some(n.clone())),
    };

    let duration_ms = millis(elapsed);
    if status == TaskStatus::Completed {
        tracing::info!(task_id = id, duration_ms, tools_used = tally.tools_used, "task completed");
        ctx.events.publish(EventKind::TaskEnd {
            task_id: id,
            title: task.title.clone(),
            status,
            duration_ms,
            tools_used: tally.tools_used,
            summary: result.map(|r| truncate_chars(&r, EVENT_SUMMARY_LIMIT)),
        });
    } else {
        let error = error.unwrap_or_else(|| status.to_string());
        tracing::warn!(task_id = id, %status, duration_ms, error = %error, "task did not complete");
        ctx.events.publish(EventKind::TaskError {
            task_id: id,
            title: task.title.clone(),
            status,
            duration_ms,
            error,
        });
    }
    status
}

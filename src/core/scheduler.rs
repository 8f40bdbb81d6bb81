//! Scheduler loop: sleeps until the next actionable moment, then runs a cycle.
//!
//! The loop task is the only owner of [`SchedulerState`]. Units report to it
//! over an mpsc channel, the control surface talks to it through a
//! [`SchedulerHandle`], and read-only [`SchedulerSnapshot`]s are published on
//! a `watch` channel after every change.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::cycle::{CycleExecutor, UnitUpdate};
use super::error::DaemonError;
use super::task::{Task, TaskId, TaskStatus};
use crate::infra::store::TaskStore;
use crate::infra::webhook::{CycleSummary, WebhookNotifier};
use crate::util::clock::now;

/// Overall daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Sleeping between cycles.
    Idle,
    /// A cycle is in flight.
    Running,
}

/// Why a cycle started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    /// The sleep ran out.
    Scheduled,
    /// Someone asked for an immediate cycle.
    Manual,
}

/// A task with a live unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    /// Task id.
    pub task_id: TaskId,
    /// Title.
    pub title: String,
    /// Executor running it.
    pub executor: String,
    /// When the unit started.
    pub started_at: DateTime<Utc>,
}

/// Read-only view of the scheduler published after every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Idle or running.
    pub state: DaemonState,
    /// Tasks whose units are executing, by id.
    pub running: Vec<RunningTask>,
    /// When the current sleep ends, if sleeping.
    pub next_wake_at: Option<DateTime<Utc>>,
    /// When the last cycle finished.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Cycles run since start.
    pub cycles_completed: u64,
    /// When the loop started.
    pub started_at: DateTime<Utc>,
}

impl SchedulerSnapshot {
    /// Ids of running tasks, ascending.
    pub fn running_task_ids(&self) -> Vec<TaskId> {
        self.running.iter().map(|t| t.task_id).collect()
    }
}

/// Messages accepted by the loop.
#[derive(Debug, Clone)]
pub enum Control {
    /// Cut the current sleep short, or queue another cycle if one is running.
    Wake,
    /// Recompute the current sleep, e.g. after a task with an earlier due
    /// date was added.
    Resize,
    /// Stop the unit running this task, if any.
    Cancel(TaskId),
    /// Run this claimed task now, alongside any cycle in flight.
    Execute(Task),
}

enum Woke {
    Cycle(WakeReason),
    Resize,
    Stop,
}

/// Cloneable client for a running [`SchedulerLoop`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<Control>,
    snapshots: watch::Receiver<SchedulerSnapshot>,
}

impl SchedulerHandle {
    /// Ask for an immediate cycle.
    pub fn wake(&self) {
        if self.control.send(Control::Wake).is_err() {
            tracing::warn!("wake ignored: scheduler loop has stopped");
        }
    }

    /// Ask the loop to re-size its sleep without forcing a cycle.
    pub fn resize(&self) {
        let _ = self.control.send(Control::Resize);
    }

    /// Signal the unit running `task_id` to stop.
    pub fn signal_cancel(&self, task_id: TaskId) {
        if self.control.send(Control::Cancel(task_id)).is_err() {
            tracing::warn!(task_id, "cancel signal ignored: scheduler loop has stopped");
        }
    }

    /// Hand a claimed task to the loop for immediate execution. Returns
    /// false if the loop has stopped.
    pub fn execute(&self, task: Task) -> bool {
        self.control.send(Control::Execute(task)).is_ok()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Watch snapshots as they change.
    pub fn watch(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshots.clone()
    }
}

/// Timing knobs for the loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Longest sleep between cycles.
    pub check_interval: Duration,
    /// Shortest sleep, so overdue tasks cannot cause a busy loop.
    pub min_sleep: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            min_sleep: Duration::from_millis(100),
        }
    }
}

/// How long to sleep before the next cycle.
///
/// The gap until the earliest due task, capped at `check_interval` and
/// floored at `min_sleep`. With nothing scheduled the loop sleeps the full
/// interval.
pub fn sleep_duration(
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    check_interval: Duration,
    min_sleep: Duration,
) -> Duration {
    let Some(next_due) = next_due else {
        return check_interval.max(min_sleep);
    };
    let until_due = (next_due - now).to_std().unwrap_or(Duration::ZERO);
    until_due.min(check_interval).max(min_sleep)
}

/// State owned by the loop task.
#[derive(Debug)]
pub struct SchedulerState {
    state: DaemonState,
    running: BTreeMap<TaskId, (RunningTask, CancellationToken)>,
    next_wake_at: Option<DateTime<Utc>>,
    last_cycle_at: Option<DateTime<Utc>>,
    cycles_completed: u64,
    started_at: DateTime<Utc>,
    wake_pending: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            state: DaemonState::Idle,
            running: BTreeMap::new(),
            next_wake_at: None,
            last_cycle_at: None,
            cycles_completed: 0,
            started_at: now(),
            wake_pending: false,
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            state: if self.running.is_empty() {
                self.state
            } else {
                DaemonState::Running
            },
            running: self.running.values().map(|(t, _)| t.clone()).collect(),
            next_wake_at: self.next_wake_at,
            last_cycle_at: self.last_cycle_at,
            cycles_completed: self.cycles_completed,
            started_at: self.started_at,
        }
    }

    fn apply(&mut self, update: UnitUpdate) {
        match update {
            UnitUpdate::Started { task, cancel } => {
                self.running.insert(task.task_id, (task, cancel));
            }
            UnitUpdate::Finished { task_id } => {
                self.running.remove(&task_id);
            }
        }
    }

    /// Apply a control message. A task to execute is handed back to the
    /// caller, which owns the cycle executor.
    fn control(&mut self, msg: Control) -> Option<Task> {
        match msg {
            Control::Wake => self.wake_pending = true,
            Control::Resize => {}
            Control::Execute(task) => return Some(task),
            Control::Cancel(task_id) => match self.running.get(&task_id) {
                Some((_, cancel)) => {
                    tracing::info!(task_id, "cancelling running task");
                    cancel.cancel();
                }
                None => tracing::debug!(task_id, "cancel for task without a live unit"),
            },
        }
        None
    }
}

/// The daemon's supervisory loop.
pub struct SchedulerLoop {
    store: Arc<dyn TaskStore>,
    cycle: CycleExecutor,
    config: LoopConfig,
    control: mpsc::UnboundedReceiver<Control>,
    snapshots: watch::Sender<SchedulerSnapshot>,
    shutdown: CancellationToken,
    state: SchedulerState,
    webhook: Option<WebhookNotifier>,
}

impl SchedulerLoop {
    /// Build a loop and the handle used to drive it.
    pub fn new(
        store: Arc<dyn TaskStore>,
        cycle: CycleExecutor,
        config: LoopConfig,
        shutdown: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let state = SchedulerState::new();
        let (snapshots, snapshot_rx) = watch::channel(state.snapshot());
        let (control_tx, control) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            control: control_tx,
            snapshots: snapshot_rx,
        };
        (
            Self {
                store,
                cycle,
                config,
                control,
                snapshots,
                shutdown,
                state,
                webhook: None,
            },
            handle,
        )
    }

    /// Post a summary to `webhook` after every completed cycle.
    #[must_use]
    pub fn with_webhook(mut self, webhook: Option<WebhookNotifier>) -> Self {
        self.webhook = webhook;
        self
    }

    /// Run until shutdown. Returns `Err` only for a fatal store error.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        tracing::info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            max_concurrent = self.cycle.config().max_concurrent_tasks,
            "scheduler loop started"
        );
        let (unit_tx, mut unit_rx) = mpsc::unbounded_channel();
        let mut manual: JoinSet<TaskStatus> = JoinSet::new();
        let mut control_open = true;

        loop {
            while manual.try_join_next().is_some() {}
            let reason = if std::mem::take(&mut self.state.wake_pending) {
                WakeReason::Manual
            } else {
                let next_due = match self.store.next_due_at() {
                    Ok(next) => next,
                    Err(err) if err.is_fatal() => return self.stop(manual, Err(err)).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot size sleep; using check interval");
                        None
                    }
                };
                let at = now();
                let sleep_for = sleep_duration(
                    next_due,
                    at,
                    self.config.check_interval,
                    self.config.min_sleep,
                );
                self.state.next_wake_at = chrono::TimeDelta::from_std(sleep_for)
                    .ok()
                    .and_then(|d| at.checked_add_signed(d));
                self.publish();
                tracing::debug!(sleep_ms = sleep_for.as_millis(), "sleeping");

                let sleep = tokio::time::sleep(sleep_for);
                tokio::pin!(sleep);
                let woke = loop {
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break Woke::Stop,
                        Some(update) = unit_rx.recv() => {
                            self.state.apply(update);
                            self.snapshots.send_replace(self.state.snapshot());
                        }
                        msg = self.control.recv(), if control_open => match msg {
                            Some(Control::Wake) => break Woke::Cycle(WakeReason::Manual),
                            Some(Control::Resize) => break Woke::Resize,
                            Some(msg) => {
                                if let Some(task) = self.state.control(msg) {
                                    manual.spawn(self.cycle.launch(task, &unit_tx, &self.shutdown));
                                }
                            }
                            None => control_open = false,
                        },
                        Some(_) = manual.join_next(), if !manual.is_empty() => {}
                        () = &mut sleep => break Woke::Cycle(WakeReason::Scheduled),
                    }
                };
                match woke {
                    Woke::Cycle(reason) => reason,
                    Woke::Resize => continue,
                    Woke::Stop => return self.stop(manual, Ok(())).await,
                }
            };

            self.state.state = DaemonState::Running;
            self.state.next_wake_at = None;
            self.publish();

            let outcome = {
                let cycle = self.cycle.run(reason, &unit_tx, &self.shutdown);
                tokio::pin!(cycle);
                loop {
                    tokio::select! {
                        biased;
                        Some(update) = unit_rx.recv() => {
                            self.state.apply(update);
                            self.snapshots.send_replace(self.state.snapshot());
                        }
                        msg = self.control.recv(), if control_open => match msg {
                            Some(msg) => {
                                if let Some(task) = self.state.control(msg) {
                                    manual.spawn(self.cycle.launch(task, &unit_tx, &self.shutdown));
                                }
                            }
                            None => control_open = false,
                        },
                        outcome = &mut cycle => break outcome,
                    }
                }
            };
            while let Ok(update) = unit_rx.try_recv() {
                self.state.apply(update);
            }

            self.state.state = DaemonState::Idle;
            self.state.last_cycle_at = Some(now());
            self.state.cycles_completed += 1;
            self.publish();

            match outcome {
                Ok(report) => {
                    if let Some(webhook) = &self.webhook {
                        webhook.notify(CycleSummary::new(reason, &report));
                    }
                    if report.deferred > 0 {
                        tracing::debug!(deferred = report.deferred, "due tasks deferred; cycling again");
                        self.state.wake_pending = true;
                    }
                }
                Err(err) if err.is_fatal() => return self.stop(manual, Err(err)).await,
                Err(err) => tracing::warn!(error = %err, "cycle failed; will retry on next wake"),
            }
            if self.shutdown.is_cancelled() {
                return self.stop(manual, Ok(())).await;
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.snapshot());
    }

    /// Let out-of-cycle units finish writing their terminal state (they see
    /// the same shutdown token), or abort them on a fatal error.
    async fn stop(
        mut self,
        mut manual: JoinSet<TaskStatus>,
        result: Result<(), DaemonError>,
    ) -> Result<(), DaemonError> {
        if result.is_err() {
            manual.abort_all();
        }
        while manual.join_next().await.is_some() {}
        match &result {
            Ok(()) => tracing::info!("scheduler loop stopped"),
            Err(err) => tracing::error!(error = %err, "scheduler loop stopped on fatal error"),
        }
        self.state.state = DaemonState::Idle;
        self.state.next_wake_at = None;
        self.publish();
        result
    }
}

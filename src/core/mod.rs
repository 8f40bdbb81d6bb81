//! Core scheduling abstractions: tasks, recurrence, cycles and the loop.

pub mod cycle;
pub mod error;
pub mod events;
pub mod executor;
pub mod schedule;
pub mod scheduler;
pub mod task;

pub use cycle::{CycleConfig, CycleExecutor, CycleReport, UnitUpdate};
pub use error::{AppResult, DaemonError, TimeoutKind};
pub use events::{DaemonEvent, EventBroadcaster, EventKind};
pub use executor::{
    AgentExecutor, ExecutionOutcome, ExecutionRequest, ExecutorRegistry, Progress, ProgressSink,
    TaskReporter,
};
pub use schedule::RecurringRule;
pub use scheduler::{
    sleep_duration, Control, DaemonState, LoopConfig, RunningTask, SchedulerHandle, SchedulerLoop,
    SchedulerSnapshot, WakeReason,
};
pub use task::{
    CancelOutcome, NewTask, Task, TaskContext, TaskId, TaskStatus, TranscriptEntry,
    TranscriptKind, ValidatedTask, DEFAULT_PRIORITY,
};

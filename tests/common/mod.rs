//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_daemon::core::{
    AgentExecutor, CycleConfig, CycleExecutor, DaemonError, DaemonEvent, EventBroadcaster,
    ExecutionOutcome, ExecutionRequest, ExecutorRegistry, ProgressSink,
};
use agent_daemon::infra::store::TaskStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// What the scripted executor does for a task, keyed by title.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return a result.
    Complete(&'static str),
    /// Return an error outcome.
    Fail(&'static str),
    /// Report through the store, then return without an outcome.
    ReportThenReturn(&'static str),
    /// Emit text lines, then return without an outcome.
    Talk(Vec<&'static str>),
    /// Return without an outcome or any output.
    Silent,
    /// Sleep, then return a result.
    Sleep(Duration),
    /// Never return and never speak.
    Hang,
    /// Emit a line every interval, forever.
    Chatter(Duration),
    /// Fail the call itself.
    Error(&'static str),
}

/// Fake agent that follows a per-title script and measures concurrency.
pub struct ScriptedExecutor {
    name: String,
    scripts: HashMap<String, Script>,
    fallback: Script,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedExecutor {
    pub fn new(fallback: Script) -> Self {
        Self::named("scripted", fallback)
    }

    pub fn named(name: &str, fallback: Script) -> Self {
        Self {
            name: name.to_string(),
            scripts: HashMap::new(),
            fallback,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, title: &str, script: Script) -> Self {
        self.scripts.insert(title.to_string(), script);
        self
    }

    /// Most calls ever in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Titles in the order their calls began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> Result<ExecutionOutcome, DaemonError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        self.started.lock().push(request.title.clone());

        let script = self
            .scripts
            .get(&request.title)
            .unwrap_or(&self.fallback)
            .clone();
        match script {
            Script::Complete(result) => Ok(ExecutionOutcome::Completed {
                result: result.to_string(),
            }),
            Script::Fail(error) => Ok(ExecutionOutcome::Failed {
                error: error.to_string(),
            }),
            Script::ReportThenReturn(result) => {
                request.reporter.complete(result)?;
                Ok(ExecutionOutcome::Unreported)
            }
            Script::Talk(lines) => {
                for line in lines {
                    progress.agent_text(line);
                }
                Ok(ExecutionOutcome::Unreported)
            }
            Script::Silent => Ok(ExecutionOutcome::Unreported),
            Script::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(ExecutionOutcome::Completed {
                    result: format!("{} done", request.title),
                })
            }
            Script::Hang => {
                futures::future::pending::<()>().await;
                Ok(ExecutionOutcome::Unreported)
            }
            Script::Chatter(every) => loop {
                progress.agent_text("still working");
                tokio::time::sleep(every).await;
            },
            Script::Error(message) => Err(DaemonError::Collaborator(message.to_string())),
        }
    }
}

/// Cycle executor over `store` with one scripted executor.
pub fn cycle_with(
    store: Arc<dyn TaskStore>,
    executor: Arc<ScriptedExecutor>,
    config: CycleConfig,
) -> (CycleExecutor, EventBroadcaster) {
    let events = EventBroadcaster::new(256);
    let cycle = CycleExecutor::new(
        store,
        ExecutorRegistry::single(executor),
        events.clone(),
        config,
    );
    (cycle, events)
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<DaemonEvent>) -> Vec<DaemonEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Names of the events in `events` that belong to `task_id`.
pub fn names_for(events: &[DaemonEvent], task_id: i64) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.kind.task_id() == Some(task_id))
        .map(|e| e.kind.name())
        .collect()
}

//! Build a daemon from [`DaemonConfig`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::core::{
    AgentExecutor, CycleExecutor, DaemonError, EventBroadcaster, ExecutorRegistry, SchedulerLoop,
};
use crate::infra::command::CommandExecutor;
use crate::infra::store::{SqliteTaskStore, TaskStore};
use crate::infra::webhook::WebhookNotifier;
use crate::runtime::{ConfigSummary, Daemon};

/// Note stored on tasks left running by a previous process.
pub const INTERRUPTED_NOTE: &str = "interrupted: daemon restarted while task was running";

/// Build the executor registry: one [`CommandExecutor`] per configured
/// program, then `extra`. The default is the configured one, else the first
/// registered.
pub fn build_registry(
    cfg: &DaemonConfig,
    extra: Vec<Arc<dyn AgentExecutor>>,
) -> Result<ExecutorRegistry, DaemonError> {
    let daemon_url = cfg.local_url();
    let mut executors: Vec<Arc<dyn AgentExecutor>> = Vec::new();
    for exec_cfg in &cfg.executors {
        let mut exec = CommandExecutor::new(&exec_cfg.name, &exec_cfg.program)
            .with_args(exec_cfg.args.iter().cloned())
            .with_env(exec_cfg.env.clone());
        if let Some(dir) = &exec_cfg.working_dir {
            exec = exec.with_working_dir(dir);
        }
        if let Some(url) = &daemon_url {
            exec = exec.with_daemon_url(url);
        }
        executors.push(Arc::new(exec));
    }
    executors.extend(extra);

    let default = match cfg.default_executor.as_deref() {
        Some(name) => name.to_string(),
        None => executors
            .first()
            .map(|e| e.name().to_string())
            .ok_or_else(|| DaemonError::Config("no executors configured".into()))?,
    };
    let registry = executors
        .into_iter()
        .fold(ExecutorRegistry::new(default), ExecutorRegistry::with);
    if !registry.names().contains(&registry.default_name()) {
        return Err(DaemonError::Config(format!(
            "default executor `{}` is not registered",
            registry.default_name()
        )));
    }
    Ok(registry)
}

/// Assembles a [`Daemon`].
pub struct DaemonBuilder {
    config: DaemonConfig,
    store: Option<Arc<dyn TaskStore>>,
    executors: Vec<Arc<dyn AgentExecutor>>,
    shutdown: Option<CancellationToken>,
}

impl DaemonBuilder {
    /// Start from a configuration.
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            store: None,
            executors: Vec::new(),
            shutdown: None,
        }
    }

    /// Use this store instead of opening `database_path`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an in-process executor alongside the configured programs.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Share an existing shutdown token.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validate, open the store, fail tasks a previous process left running
    /// and wire everything together.
    pub fn build(self) -> Result<Daemon, DaemonError> {
        self.config.validate().map_err(DaemonError::Config)?;
        let registry = build_registry(&self.config, self.executors)?;

        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteTaskStore::open(&self.config.database_path)?),
        };
        let recovered = store.recover_interrupted(INTERRUPTED_NOTE)?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), ids = ?recovered, "failed tasks interrupted by a previous run");
        }

        let summary = ConfigSummary {
            check_interval_secs: self.config.check_interval_secs,
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            max_tasks_per_cycle: self.config.max_tasks_per_cycle,
            task_timeout_secs: self.config.task_timeout_secs,
            inactivity_timeout_secs: self.config.inactivity_timeout_secs,
            executors: registry.names().into_iter().map(str::to_string).collect(),
            default_executor: registry.default_name().to_string(),
        };
        tracing::info!(executors = ?summary.executors, default = %summary.default_executor, "executors registered");

        let events = EventBroadcaster::new(self.config.event_buffer);
        let cycle = CycleExecutor::new(
            Arc::clone(&store),
            registry,
            events.clone(),
            self.config.cycle_config(),
        );
        let shutdown = self.shutdown.unwrap_or_default();
        let (scheduler, scheduler_handle) = SchedulerLoop::new(
            Arc::clone(&store),
            cycle,
            self.config.loop_config(),
            shutdown.clone(),
        );
        let webhook = self.config.webhook_url.as_deref().map(WebhookNotifier::new);
        if let Some(hook) = &webhook {
            tracing::info!(url = %hook.url(), "cycle webhook enabled");
        }
        let scheduler = scheduler.with_webhook(webhook);
        Ok(Daemon::new(
            summary,
            store,
            events,
            scheduler,
            scheduler_handle,
            shutdown,
        ))
    }
}

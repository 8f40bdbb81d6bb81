//! Daemon configuration: file, `.env` and environment layers.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{CycleConfig, DaemonError, LoopConfig};

/// One external agent program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Registry name, matched against a task's `executor`/`provider` context key.
    pub name: String,
    /// Program to run.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Root daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// HTTP listen address.
    pub bind_addr: String,
    /// Longest sleep between cycles, in seconds.
    pub check_interval_secs: u64,
    /// Shortest sleep between cycles, in milliseconds.
    pub min_sleep_ms: u64,
    /// Concurrent executor calls.
    pub max_concurrent_tasks: usize,
    /// Optional cap on tasks launched per cycle.
    pub max_tasks_per_cycle: Option<usize>,
    /// Wall-clock ceiling per task, in seconds.
    pub task_timeout_secs: u64,
    /// Ceiling on silence between progress events, in seconds.
    pub inactivity_timeout_secs: u64,
    /// Events buffered per stream subscriber.
    pub event_buffer: usize,
    /// Executor used when a task names none. Defaults to the first configured.
    pub default_executor: Option<String>,
    /// Agent programs.
    pub executors: Vec<ExecutorConfig>,
    /// Cycle summaries are posted here when set.
    pub webhook_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("agent_daemon.db"),
            bind_addr: "127.0.0.1:8420".to_string(),
            check_interval_secs: 300,
            min_sleep_ms: 100,
            max_concurrent_tasks: 3,
            max_tasks_per_cycle: None,
            task_timeout_secs: 3600,
            inactivity_timeout_secs: 600,
            event_buffer: 100,
            default_executor: None,
            executors: Vec::new(),
            webhook_url: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("{key}: cannot parse `{raw}`"))
}

impl DaemonConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval_secs == 0 {
            return Err("check_interval_secs must be greater than 0".into());
        }
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be greater than 0".into());
        }
        if self.max_tasks_per_cycle == Some(0) {
            return Err("max_tasks_per_cycle must be greater than 0 when set".into());
        }
        if self.task_timeout_secs == 0 {
            return Err("task_timeout_secs must be greater than 0".into());
        }
        if self.inactivity_timeout_secs == 0 {
            return Err("inactivity_timeout_secs must be greater than 0".into());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than 0".into());
        }
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("bind_addr `{}` invalid: {e}", self.bind_addr))?;

        let mut names = BTreeSet::new();
        for exec in &self.executors {
            if exec.name.trim().is_empty() {
                return Err("executor name must not be empty".into());
            }
            if exec.program.trim().is_empty() {
                return Err(format!("executor `{}` has no program", exec.name));
            }
            if !names.insert(exec.name.as_str()) {
                return Err(format!("executor `{}` defined twice", exec.name));
            }
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("webhook_url `{url}` must be an http(s) URL"));
            }
        }
        if let Some(default) = &self.default_executor {
            if !self.executors.is_empty() && !names.contains(default.as_str()) {
                return Err(format!("default_executor `{default}` is not a configured executor"));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Layer `.env`, an optional JSON file and the process environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            tracing::debug!(path = %env_file.display(), "loaded .env");
        }
        let mut cfg = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    DaemonError::Config(format!("reading {}: {e}", path.display()))
                })?;
                serde_json::from_str(&text)
                    .map_err(|e| DaemonError::Config(format!("{}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())
            .map_err(DaemonError::Config)?;
        cfg.validate().map_err(DaemonError::Config)?;
        Ok(cfg)
    }

    /// Override fields from environment variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENT_DAEMON_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENT_DAEMON_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("AGENT_CHECK_INTERVAL") {
            self.check_interval_secs = parse_env("AGENT_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("AGENT_MAX_CONCURRENT") {
            self.max_concurrent_tasks = parse_env("AGENT_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = lookup("AGENT_MAX_TASKS") {
            self.max_tasks_per_cycle = Some(parse_env("AGENT_MAX_TASKS", &v)?);
        }
        if let Some(v) = lookup("AGENT_TASK_TIMEOUT") {
            self.task_timeout_secs = parse_env("AGENT_TASK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("AGENT_INACTIVITY_TIMEOUT") {
            self.inactivity_timeout_secs = parse_env("AGENT_INACTIVITY_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("AGENT_DEFAULT_EXECUTOR") {
            self.default_executor = Some(v);
        }
        if let Some(v) = lookup("AGENT_WEBHOOK_URL") {
            self.webhook_url = Some(v).filter(|url| !url.trim().is_empty());
        }
        Ok(())
    }

    /// Executor used when a task names none.
    pub fn default_executor_name(&self) -> Option<&str> {
        self.default_executor
            .as_deref()
            .or_else(|| self.executors.first().map(|e| e.name.as_str()))
    }

    /// Cycle executor settings.
    pub const fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            max_tasks_per_cycle: self.max_tasks_per_cycle,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
        }
    }

    /// Scheduler loop settings.
    pub const fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            min_sleep: Duration::from_millis(self.min_sleep_ms),
        }
    }

    /// URL local agent programs should use to reach the control surface.
    pub fn local_url(&self) -> Option<String> {
        let mut addr: SocketAddr = self.bind_addr.parse().ok()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        Some(format!("http://{addr}"))
    }
}

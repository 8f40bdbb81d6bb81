//! Agent executor that runs an external program per task.
//!
//! The program receives the task as one JSON line on stdin and reports back
//! on stdout, one JSON object per line:
//!
//! ```text
//! {"type":"text","text":"Looking at the inbox"}
//! {"type":"tool_use","tool":"Bash"}
//! {"type":"result","result":"3 messages archived"}
//! {"type":"error","error":"mailbox unavailable"}
//! ```
//!
//! Lines that are not JSON count as agent text. A non-zero exit fails the
//! task with the tail of stderr; exiting cleanly without a `result` or
//! `error` line leaves the outcome to the cycle's reconciliation step.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::core::{
    AgentExecutor, DaemonError, ExecutionOutcome, ExecutionRequest, ProgressSink, TaskContext,
    TaskId,
};

/// Lines of stderr kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Environment variable carrying the task id.
pub const TASK_ID_ENV: &str = "AGENT_DAEMON_TASK_ID";
/// Environment variable carrying the daemon's base URL.
pub const DAEMON_URL_ENV: &str = "AGENT_DAEMON_URL";

/// Runs a configured program for each task.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    daemon_url: Option<String>,
}

#[derive(Serialize)]
struct TaskInput<'a> {
    task_id: TaskId,
    cycle_id: String,
    title: &'a str,
    description: &'a str,
    priority: i32,
    context: &'a TaskContext,
}

#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentLine {
    Text { text: String },
    ToolUse { tool: String },
    Result { result: String },
    Error { error: String },
}

impl CommandExecutor {
    /// Executor named `name` that runs `program` with no arguments.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            daemon_url: None,
        }
    }

    /// Set the program arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add environment variables.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Run the program from `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Base URL exported so the program can report completion itself.
    #[must_use]
    pub fn with_daemon_url(mut self, url: impl Into<String>) -> Self {
        self.daemon_url = Some(url.into());
        self
    }

    fn command(&self, task_id: TaskId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env(TASK_ID_ENV, task_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = &self.daemon_url {
            cmd.env(DAEMON_URL_ENV, url);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn parse_line(line: &str) -> Option<AgentLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(trimmed).unwrap_or_else(|_| AgentLine::Text {
            text: trimmed.to_string(),
        }),
    )
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        progress: ProgressSink,
    ) -> Result<ExecutionOutcome, DaemonError> {
        let task_id = request.task_id;
        tracing::debug!(task_id, executor = %self.name, program = %self.program, "spawning agent process");
        let mut child = self.command(task_id).spawn().map_err(|e| {
            DaemonError::Collaborator(format!("spawning `{}`: {e}", self.program))
        })?;

        let input = TaskInput {
            task_id,
            cycle_id: request.cycle_id.to_string(),
            title: &request.title,
            description: &request.description,
            priority: request.priority,
            context: &request.context,
        };
        let mut payload = serde_json::to_vec(&input)
            .map_err(|e| DaemonError::Collaborator(format!("encoding task: {e}")))?;
        payload.push(b'\n');
        // Written concurrently with the stdout drain so a chatty program
        // cannot block on a full pipe while we block on its stdin.
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The program may exit without reading its input.
                if let Err(err) = stdin.write_all(&payload).await {
                    tracing::debug!(task_id, error = %err, "agent process closed stdin early");
                }
            })
        });

        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        let mut outcome = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| DaemonError::Collaborator(format!("reading agent output: {e}")))?
            {
                match parse_line(&line) {
                    Some(AgentLine::Text { text }) => progress.agent_text(text),
                    Some(AgentLine::ToolUse { tool }) => progress.tool_use(tool),
                    Some(AgentLine::Result { result }) => {
                        outcome = Some(ExecutionOutcome::Completed { result });
                    }
                    Some(AgentLine::Error { error }) => {
                        outcome = Some(ExecutionOutcome::Failed { error });
                    }
                    None => {}
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DaemonError::Collaborator(format!("waiting for agent process: {e}")))?;
        if let Some(writer) = stdin_writer {
            let _ = writer.await;
        }
        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        tracing::debug!(task_id, exit = ?status.code(), "agent process exited");

        if !status.success() {
            if let Some(failed @ ExecutionOutcome::Failed { .. }) = outcome {
                return Ok(failed);
            }
            let mut error = format!("`{}` exited with {status}", self.program);
            if !stderr.is_empty() {
                error.push_str(": ");
                error.push_str(&stderr);
            }
            return Ok(ExecutionOutcome::Failed { error });
        }
        Ok(outcome.unwrap_or(ExecutionOutcome::Unreported))
    }
}

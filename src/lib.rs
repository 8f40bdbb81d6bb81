//! # Agent Daemon
//!
//! A persistent background task daemon for LLM agent workloads.
//!
//! Tasks live in a SQLite store. A single scheduler loop sleeps until the
//! next task is due (capped by a check interval), then runs a cycle: every
//! due task is claimed atomically and handed to an [`core::AgentExecutor`]
//! under a concurrency cap, with a wall-clock and an inactivity timeout.
//! Whatever happens inside the executor, the cycle reconciles the task to a
//! terminal state, records a transcript and reschedules recurring work.
//! Lifecycle events fan out to any number of subscribers, and an HTTP
//! control surface (axum, server-sent events) lets other processes add
//! tasks, wake the loop and watch progress.
//!
//! ## Layout
//!
//! - [`core`]: task model, recurrence rules, events, the cycle executor and
//!   the scheduler loop
//! - [`infra`]: SQLite and in-memory task stores, the process executor, the
//!   cycle webhook
//! - [`config`]: layered configuration
//! - [`builders`]: assemble a [`runtime::Daemon`] from configuration
//! - [`runtime`]: daemon wiring and the HTTP routes
//!
//! ## Embedding
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agent_daemon::builders::DaemonBuilder;
//! use agent_daemon::config::DaemonConfig;
//! use agent_daemon::core::NewTask;
//!
//! let daemon = DaemonBuilder::new(DaemonConfig::default())
//!     .with_executor(Arc::new(my_executor))
//!     .build()?;
//! let handle = daemon.handle();
//! handle.submit(NewTask::new("triage inbox").with_rule("daily_09:00"), true)?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8420").await?;
//! daemon.serve(listener).await?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, recurrence, events, cycle execution and the scheduler loop.
pub mod core;
/// Configuration models and loading.
pub mod config;
/// Builders to construct the daemon from configuration.
pub mod builders;
/// Storage backends and process executors.
pub mod infra;
/// Daemon wiring and the HTTP control surface.
pub mod runtime;
/// Shared utilities.
pub mod util;

pub use builders::DaemonBuilder;
pub use config::DaemonConfig;
pub use core::{AgentExecutor, DaemonError, NewTask, Task, TaskStatus};
pub use runtime::{Daemon, DaemonHandle};

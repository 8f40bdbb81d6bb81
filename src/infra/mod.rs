//! Infrastructure adapters: task storage backends, process-based executors
//! and the cycle webhook.

pub mod command;
pub mod store;
pub mod webhook;

pub use command::CommandExecutor;
pub use store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
pub use webhook::{CycleSummary, WebhookNotifier};

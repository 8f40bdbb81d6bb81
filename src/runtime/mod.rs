//! Runtime: daemon wiring and the HTTP control surface.

pub mod api;
pub mod daemon;

pub use api::router;
pub use daemon::{ConfigSummary, Daemon, DaemonHandle, StatusReport, TaskDetail};

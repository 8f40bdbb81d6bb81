//! Configuration models for the daemon, its executors and timeouts.

pub mod daemon;

pub use daemon::{DaemonConfig, ExecutorConfig};

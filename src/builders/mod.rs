//! Builders that assemble a [`crate::runtime::Daemon`] from configuration.

pub mod daemon_builder;

pub use daemon_builder::{build_registry, DaemonBuilder};

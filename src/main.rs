//! `agent-daemon` binary: load configuration, serve until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use agent_daemon::builders::DaemonBuilder;
use agent_daemon::config::DaemonConfig;
use agent_daemon::util::telemetry::init_tracing;

/// Persistent background task daemon for LLM agents.
#[derive(Debug, Parser)]
#[command(name = "agent-daemon", version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the configuration.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(long)]
    addr: Option<String>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    if let Some(addr) = cli.addr {
        config.bind_addr = addr;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(
        db = %config.database_path.display(),
        addr = %config.bind_addr,
        "starting agent daemon"
    );

    let shutdown = CancellationToken::new();
    let daemon = DaemonBuilder::new(config)
        .with_shutdown(shutdown.clone())
        .build()?;
    tokio::spawn(wait_for_signal(shutdown));
    daemon.serve(listener).await
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                    () = shutdown.cancelled() => return,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot watch SIGTERM; ctrl-c only");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    () = shutdown.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = shutdown.cancelled() => return,
    }
    tracing::info!("shutdown requested");
    shutdown.cancel();
}

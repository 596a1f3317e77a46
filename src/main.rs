use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tollgate::config::TollgateConfig;
use tollgate::gate::{spawn_cleanup_task, Gate};
use tollgate::http::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Per-caller rate limiting service")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Purge expired counter records once and exit
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let gate = Arc::new(Gate::from_config(&config).await?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, gate).await,
        Command::Cleanup => {
            let removed = gate.cleanup().await?;
            info!(removed, "Cleanup finished");
            Ok(())
        }
    }
}

async fn serve(config: TollgateConfig, gate: Arc<Gate>) -> anyhow::Result<()> {
    info!("Starting Tollgate rate limiting service");

    let interval = config.rate_limiting.cleanup_interval_secs;
    let janitor = (interval > 0).then(|| {
        info!(interval_secs = interval, "Spawning cleanup task");
        spawn_cleanup_task(gate.clone(), Duration::from_secs(interval))
    });

    let result = HttpServer::new(config.server.http_addr, gate)
        .serve_with_shutdown(shutdown_signal())
        .await;

    if let Some(janitor) = janitor {
        janitor.abort();
    }
    result?;

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

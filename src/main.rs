use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use warden::config::{LoggingConfig, WardenConfig};
use warden::modal::{ModalRouter, SecretTable};
use warden::ratelimit::CommandGate;
use warden::schedule::Shutdown;

/// Command throttling and modal correlation for a guild chat bot.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. "warden=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WardenConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging)?;

    info!("Starting Warden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Loaded configuration file"),
        None => info!("No configuration file given, using defaults and environment"),
    }
    match &config.logging.file {
        Some(path) => info!(path = %path.display(), "Logging to file"),
        None => info!("No log file configured, logging to stdout"),
    }

    let gate = CommandGate::from_config(&config.limits)?;
    info!(
        user_capacity = gate.users().capacity(),
        channel_capacity = gate.channels().capacity(),
        decay_secs = config.limits.user.decay_interval_secs,
        "Command gate initialized"
    );

    let shutdown = Shutdown::new();
    let secrets = SecretTable::with_tokio_clock(config.modals.max_age())?;
    let sweeper = secrets.spawn_sweeper(config.modals.sweep_interval(), shutdown.subscribe())?;
    let router = ModalRouter::new(secrets);
    info!(
        max_age_secs = config.modals.max_age_secs,
        sweep_interval_secs = config.modals.sweep_interval_secs,
        "Modal router initialized"
    );

    shutdown_signal().await;

    shutdown.trigger();
    sweeper.await.context("modal sweeper panicked")?;
    gate.shutdown().await;

    info!(
        outstanding_prompts = router.secrets().len(),
        "Warden stopped"
    );
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log filter {:?}", logging.level))?;

    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(writer);

    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!(e))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

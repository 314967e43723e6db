//! cadence-send - Background daemon for scheduled publishing
//!
//! Runs the scheduler (and the folder watcher, when configured) until a
//! shutdown signal arrives, then drains in-flight executions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use libcadence::config::Config;
use libcadence::content::{ContentProvider, OpenAiCompatibleProvider};
use libcadence::logging::LoggingConfig;
use libcadence::platforms::CommandDriverFactory;
use libcadence::vault::MasterKey;
use libcadence::watcher::FolderWatcher;
use libcadence::worker::WorkerDeps;
use libcadence::{Database, Result, Scheduler};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cadence-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
cadence-send - Background daemon for scheduled publishing

DESCRIPTION:
    cadence-send is a long-running daemon that executes queued jobs when
    they come due. It polls the database, takes a per-account lease so one
    account never runs two jobs at once, drives the platform through the
    configured automation helper, and records every attempt.

    Failed attempts are retried with exponential backoff according to the
    [retry] section. CAPTCHA and verification pages are never solved: the
    job is flagged as needing attention and retried after a cooldown.

USAGE:
    # Run in foreground (logs to stderr)
    cadence-send

    # Poll every 10 seconds
    cadence-send --poll-interval 10

    # Process due jobs once, wait for them, and exit
    cadence-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (waits up to shutdown_grace_secs
                      for running executions, then returns them to the queue)

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    [scheduler]
    poll_interval_secs = 5
    pool_size = 2
    driver_timeout_secs = 120

    [automation]
    command = \"cadence-browser\"

ENVIRONMENT:
    CADENCE_CONFIG       - Path to config file
    CADENCE_DB_PATH      - Path to database file
    CADENCE_MASTER_KEY   - Key for stored account passwords
    CADENCE_LOG_FORMAT   - text, json or pretty

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check for due jobs (default: 5)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit
    #[arg(long)]
    #[arg(help = "Dispatch due jobs once, wait for them to finish, and exit")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env("info", cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        config.scheduler.poll_interval_secs = secs;
    }
    config.validate()?;

    let db = Database::new(&config.database.path).await?;
    let deps = worker_deps(&config)?;
    let mut scheduler = Scheduler::new(db.clone(), &config, deps);
    let watcher = config
        .watch
        .clone()
        .map(|watch| FolderWatcher::new(db.clone(), watch));
    if let Some(watcher) = &watcher {
        watcher.verify().await?;
    }

    info!(
        poll_interval = config.scheduler.poll_interval_secs,
        pool_size = config.scheduler.pool_size,
        "cadence-send starting"
    );

    if cli.once {
        scheduler.start().await?;
        if let Some(watcher) = &watcher {
            let created = watcher.scan(Utc::now()).await?;
            info!("folder scan created {} job(s)", created.len());
        }
        let summary = scheduler.tick().await?;
        info!(dispatched = summary.dispatched, "processed due jobs once");
        scheduler.shutdown().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    let watcher_task = watcher.map(|watcher| {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { watcher.run(wait_for_shutdown(rx)).await })
    });

    let result = scheduler.run(wait_for_shutdown(shutdown_rx)).await;

    if let Some(task) = watcher_task {
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(Err(e))) => error!("folder watcher stopped: {}", e),
            Ok(Err(e)) => error!("folder watcher task failed: {}", e),
            Err(_) => warn!("folder watcher did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }
    }

    info!("cadence-send stopped");
    result
}

/// Driver factory, content provider and master key for the worker pool.
fn worker_deps(config: &Config) -> Result<WorkerDeps> {
    let mut deps = WorkerDeps::new(Arc::new(CommandDriverFactory::new(
        config.automation.clone(),
    )));
    if config.automation.command.is_none() {
        warn!("no [automation] command configured; executions will fail until one is set");
    }

    match OpenAiCompatibleProvider::from_config(&config.content) {
        Ok(provider) => {
            let provider: Arc<dyn ContentProvider> = Arc::new(provider);
            deps = deps.with_content_provider(provider);
        }
        Err(e) => info!("content generation disabled: {}", e),
    }

    match MasterKey::from_env()? {
        Some(key) => deps = deps.with_master_key(key),
        None => info!("CADENCE_MASTER_KEY not set; only stored sessions can be used"),
    }
    Ok(deps)
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
#[cfg(unix)]
fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libcadence::CadenceError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "received shutdown signal, stopping gracefully...");
            let _ = tx.send(true);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, stopping gracefully...");
            let _ = tx.send(true);
        }
    });
    Ok(())
}

//! Feishu Drive sync daemon
//!
//! `serve` runs the periodic scheduler until a shutdown signal; `run-once`
//! performs a single manual pass; `status` prints the last run summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::signal;

use feishu_sync_daemon::app_state::{app_state_factory, AppState};
use feishu_sync_daemon::log_appender::setup_logging;
use feishu_sync_daemon::scheduler::SyncScheduler;
use feishu_sync_daemon::sync::SyncService;

#[derive(Parser)]
#[command(name = "feishu-sync-daemon", about = "Feishu Drive sync daemon")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/feishu-sync/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted.
    Serve,
    /// Trigger one reconciliation pass and print its summary.
    RunOnce {
        /// Scan the local side only; mutate nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the most recent run summary.
    Status,
}

fn sync_service(app: &AppState) -> Arc<SyncService> {
    Arc::new(SyncService::new(
        app.config.clone(),
        app.store.clone(),
        app.drive.clone(),
        app.log_sink.clone(),
        app.run_history.clone(),
    ))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let app = app_state_factory(&cli.config).await?;
    {
        let cfg = app.config.read().await;
        setup_logging(&cfg.logging.level, PathBuf::from(&cfg.logging.file).as_path())
            .context("Failed to set up logging")?;
    }

    match cli.command {
        Command::Serve => serve(app).await.map(|_| ExitCode::SUCCESS),
        Command::RunOnce { dry_run } => run_once(app, dry_run).await,
        Command::Status => status(app),
    }
}

async fn serve(app: AppState) -> Result<()> {
    info!("starting sync daemon");
    let service = sync_service(&app);
    let scheduler = SyncScheduler::new(service, app.config.clone());
    let handle = scheduler.start();

    shutdown_signal().await;
    info!("shutdown signal received");

    scheduler.stop();
    let _ = handle.await;
    info!("sync daemon exited cleanly");
    Ok(())
}

async fn run_once(app: AppState, dry_run: bool) -> Result<ExitCode> {
    let service = sync_service(&app);
    let result = if dry_run {
        service.try_dry_run().await
    } else {
        service.try_run("manual").await
    };

    match result {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.is_failed() {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(busy) => {
            eprintln!("{}", busy);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn status(app: AppState) -> Result<ExitCode> {
    match app.run_history.last()? {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no runs recorded yet");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

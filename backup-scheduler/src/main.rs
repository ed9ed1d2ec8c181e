//! Backup Scheduler - Main entry point
//!
//! Runs registered backup schedules against local archive storage until
//! SIGINT or SIGTERM.

use anyhow::Result;
use backup_engine::{BackupService, Clock, LocalStorage, SystemClock};
use backup_scheduler::{logger, shutdown::ShutdownCoordinator, Config, Scheduler, StateStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    logger::init(log_level, config.log.file.as_deref())?;

    tracing::info!(
        base_dir = %config.storage.base_dir.display(),
        state_file = %config.scheduler.state_file.display(),
        "Starting backup-scheduler v{}",
        env!("CARGO_PKG_VERSION")
    );

    let storage = LocalStorage::open(&config.storage.base_dir).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(BackupService::new(Arc::new(storage), clock.clone(), config.engine.clone()));

    // Startup sweep: expired archives and leftovers from an earlier crash
    match engine.cleanup().await {
        Ok(report) => tracing::info!(
            expired = report.expired.len(),
            orphans = report.orphans.len(),
            failures = report.failures.len(),
            "Startup cleanup finished"
        ),
        Err(e) => tracing::warn!("Startup cleanup failed: {}", e),
    }

    let scheduler = Scheduler::load(engine, clock, StateStore::new(&config.scheduler.state_file)).await?;
    scheduler.start();

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
    let mut shutdown_rx = shutdown_coordinator.subscribe();
    let signal_coordinator = shutdown_coordinator.clone();
    tokio::spawn(async move { signal_coordinator.wait_for_signal().await });

    let _ = shutdown_rx.recv().await;

    tracing::info!("Shutting down...");
    scheduler.shutdown(config.scheduler.shutdown_grace()).await;
    tracing::info!("Scheduler stopped");

    Ok(())
}

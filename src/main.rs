pub mod config;
pub mod dashboard;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod reading;

use crate::config::AppConfig;
use crate::dashboard::Dashboard;
use crate::mqtt::{BrokerOptions, ConnectionManager};
use crate::persistence::{ConfigStore, FileKvStore, FileRepository, SyncWorker};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Headless water quality dashboard fed by an MQTT broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Restore the default broker connection settings and exit
    #[arg(long)]
    reset_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config_dir = config::config_dir();
    let config_store = ConfigStore::new(FileKvStore::in_dir(&config_dir));

    if cli.reset_config {
        let defaults = config_store
            .reset()
            .await
            .map_err(|e| eyre!("Failed to reset connection config: {}", e))?;
        info!(broker = %defaults, "connection config reset to defaults");
        return Ok(());
    }

    let app_config = AppConfig::load(&config_dir).await;
    let connection_config = config_store.load().await;
    info!(broker = %connection_config, "using connection config");

    let repository = Arc::new(
        FileRepository::open(app_config.readings_path())
            .await
            .map_err(|e| eyre!("Failed to open reading store: {}", e))?,
    );

    let (reading_tx, reading_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = mpsc::unbounded_channel();

    let worker = SyncWorker::new(repository.clone(), app_config.throttle());
    let worker_handle = tokio::spawn(worker.run(reading_rx));
    let state_handle = tokio::spawn(dashboard::report_connection(
        state_rx,
        app_config.backoff.max_attempts,
    ));

    let shutdown = CancellationToken::new();
    let dashboard = Dashboard::new(repository.clone(), app_config.dashboard.clone());
    let live_subscription = dashboard.follow_recent();
    let refresher = dashboard.spawn_refresher(shutdown.clone());

    let mut manager = ConnectionManager::new(app_config.backoff, BrokerOptions::default());
    manager.start(connection_config, reading_tx, state_tx);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Releases the reading and state senders, which ends the worker and reporter.
    manager.stop();
    live_subscription.unsubscribe();
    shutdown.cancel();

    let counters = worker_handle.await?;
    if state_handle.await.is_err() {
        warn!("connection reporter ended abnormally");
    }
    if refresher.await.is_err() {
        warn!("history refresher ended abnormally");
    }

    info!(
        received = counters.received,
        forwarded = counters.forwarded,
        failed = counters.failed,
        "session finished"
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

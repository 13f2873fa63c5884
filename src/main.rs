//! CLI entry point for the feed refresher.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use refresher_core::{Config, Daemon, Database, SqliteStore, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    // Priority: RUST_LOG env var > quiet flag > verbose flag > config log_level > info
    let default_level = if args.quiet {
        "error".to_string()
    } else {
        match args.verbose {
            0 => config.log_level.clone().unwrap_or_else(|| "info".to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!(
        workers = config.worker_pool_size,
        batch_size = config.batch_size,
        polling_frequency_minutes = config.polling_frequency_minutes,
        scheduler = ?config.polling_scheduler,
        "Refresher starting"
    );

    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let store = Arc::new(SqliteStore::new(db.clone()));
    let daemon = Daemon::new(Arc::new(config), store);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    match args.command() {
        Command::Run => {
            daemon.run(cancel).await?;
        }
        Command::RefreshFeeds => {
            let pushed = daemon.refresh_batch(&cancel).await?;
            info!(
                pushed,
                processed = daemon.pool().processed(),
                failed = daemon.pool().failed(),
                "Refresh complete"
            );
        }
        Command::Refresh { user, feed, force } => {
            let result = daemon
                .refresher()
                .refresh_feed(user, feed, force, &cancel)
                .await
                .with_context(|| format!("failed to refresh feed {feed} of user {user}"))?;
            info!(
                refreshed = result.refreshed,
                not_modified = ?result.not_modified,
                created = result.created_len(),
                updated = result.updated_len(),
                "Refresh complete"
            );
        }
    }

    db.close().await;
    Ok(())
}

//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use refresher_core::Config;

/// Feed refresh scheduler and fetch engine.
///
/// Periodically selects due feeds, fetches them with per-host connection
/// limits and conditional requests, and stores new entries.
#[derive(Parser, Debug)]
#[command(name = "refresher")]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Database URL, overrides the configuration file
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Number of refresh workers (1-256)
    #[arg(short = 'w', long, global = true, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub workers: Option<u16>,

    /// Maximum feeds per batch
    #[arg(short = 'b', long, global = true)]
    pub batch_size: Option<usize>,

    /// Minutes between scheduler ticks and base polling interval
    #[arg(long, global = true, value_parser = clap::value_parser!(i64).range(1..))]
    pub polling_frequency: Option<i64>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler until interrupted (default)
    Run,

    /// Refresh one batch of due feeds, then exit
    RefreshFeeds,

    /// Refresh a single feed
    Refresh {
        /// Owner of the feed
        #[arg(long)]
        user: i64,

        /// Feed id
        #[arg(long)]
        feed: i64,

        /// Ignore cache validators and the stored body fingerprint
        #[arg(long)]
        force: bool,
    },
}

impl Args {
    /// Subcommand to execute, `run` when none was given.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Applies command-line overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.database_url {
            config.database_url.clone_from(url);
        }
        if let Some(workers) = self.workers {
            config.worker_pool_size = usize::from(workers);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(minutes) = self.polling_frequency {
            config.polling_frequency_minutes = minutes;
        }
    }
}

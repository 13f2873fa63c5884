//! Refresher Core Library
//!
//! Scheduling and fetch engine of a feed reader: it decides when each
//! subscribed feed is due, fetches it politely, validates and parses the
//! response, and persists the outcome.
//!
//! # Architecture
//!
//! - [`scheduler`] - Selects batches of due feeds and runs cleanup tasks
//! - [`worker`] - Fixed-size pool executing refresh jobs
//! - [`refresh`] - Per-feed refresh state machine
//! - [`fetch`] - HTTP requests, response validation, per-host connection limits
//! - [`schedule`] - Next-check computation
//! - [`reader`] - Feed parsing and entry processing
//! - [`storage`] - Storage traits with in-memory and `SQLite` implementations
//! - [`daemon`] - Component wiring and supervision

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod fetch;
pub mod locale;
pub mod model;
pub mod reader;
pub mod refresh;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod user_agent;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, ConfigError, PollingScheduler};
pub use daemon::{Daemon, DaemonError, shutdown_signal};
pub use db::{Database, DbError};
pub use error::{ErrorKind, ParseErrorKind, RefreshError};
pub use model::{Entry, Feed, Job, NotModifiedReason, RefreshResult, User};
pub use refresh::FeedRefresher;
pub use schedule::NextCheckScheduler;
pub use scheduler::{CleanupReport, Scheduler, SchedulerError};
pub use storage::{MemoryStore, SqliteStore, StoreError};
pub use worker::{JobHandler, PoolError, WorkerPool};

//! Storage seams used by the refresh engine.
//!
//! The engine never talks to a database directly. It depends on three
//! traits, split by caller:
//!
//! - [`FeedStore`]: everything one refresh reads and writes.
//! - [`BatchSource`]: the due-feed query driving the scheduler.
//! - [`CleanupStore`]: periodic housekeeping.
//!
//! [`MemoryStore`] implements all three in process; [`SqliteStore`] persists
//! to `SQLite` through sqlx.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{BatchQuery, Entry, Feed, Job, RefreshResult, User};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors raised by storage implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or connection failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be mapped back to the model.
    #[error("invalid stored value for {field}: {value}")]
    Corrupt { field: &'static str, value: String },

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a backend error from a message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Creates a corrupt-value error.
    pub fn corrupt(field: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            field,
            value: value.into(),
        }
    }
}

/// Reads and writes performed during one feed refresh.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Loads a feed owned by `user_id`.
    async fn feed_by_id(&self, user_id: i64, feed_id: i64) -> Result<Option<Feed>, StoreError>;

    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, StoreError>;

    /// Whether another feed of the same user already uses `feed_url`.
    async fn another_feed_url_exists(
        &self,
        user_id: i64,
        feed_id: i64,
        feed_url: &str,
    ) -> Result<bool, StoreError>;

    /// Entries published during the last seven days.
    async fn weekly_feed_entry_count(&self, user_id: i64, feed_id: i64)
    -> Result<i64, StoreError>;

    /// Persists every mutable field of `feed`.
    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError>;

    /// Persists the error counter, error message and check timestamps only.
    async fn update_feed_error(&self, feed: &Feed) -> Result<(), StoreError>;

    /// Inserts new entries and, when `update_existing`, rewrites known ones.
    ///
    /// The returned result lists created and updated entries; its timing
    /// fields are left for the caller.
    async fn refresh_feed_entries(
        &self,
        user_id: i64,
        feed_id: i64,
        entries: &[Entry],
        update_existing: bool,
    ) -> Result<RefreshResult, StoreError>;

    /// Subset of `hashes` already stored for the feed.
    async fn known_entry_hashes(
        &self,
        feed_id: i64,
        hashes: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Stored reading time of an entry, if the entry exists.
    async fn get_read_time(&self, feed_id: i64, hash: &str) -> Result<Option<i64>, StoreError>;
}

/// Source of due jobs.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Feeds matching `query`, oldest next-check first.
    async fn due_jobs(&self, query: &BatchQuery) -> Result<Vec<Job>, StoreError>;
}

/// Periodic housekeeping.
#[async_trait]
pub trait CleanupStore: Send + Sync {
    /// Marks read entries unchanged for `older_than_days` as removed, at most
    /// `limit` per call. Returns how many were archived.
    async fn archive_read_entries(&self, older_than_days: i64, limit: i64)
    -> Result<u64, StoreError>;

    /// Deletes sessions created more than `older_than_days` ago.
    async fn delete_expired_sessions(&self, older_than_days: i64) -> Result<u64, StoreError>;
}

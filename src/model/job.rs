//! Units of scheduled work.

/// One feed to refresh, produced by the scheduler and consumed once by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    pub user_id: i64,
    pub feed_id: i64,
    /// Used only to spread a batch across hosts.
    pub feed_url: String,
}

impl Job {
    #[must_use]
    pub fn new(user_id: i64, feed_id: i64, feed_url: impl Into<String>) -> Self {
        Self {
            user_id,
            feed_id,
            feed_url: feed_url.into(),
        }
    }

    /// Returns the host used to group jobs, falling back to the raw URL.
    #[must_use]
    pub fn host_key(&self) -> String {
        url::Url::parse(&self.feed_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_else(|| self.feed_url.clone())
    }
}

/// Filters applied when selecting the next batch of due feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchQuery {
    /// Maximum number of jobs, 0 for no limit.
    pub batch_size: usize,
    /// Feeds whose error counter reached this value are skipped, 0 disables the filter.
    pub error_limit: i64,
    pub exclude_disabled: bool,
    pub next_check_expired: bool,
}

impl BatchQuery {
    /// The query used by the feed scheduler.
    #[must_use]
    pub fn due(batch_size: usize, error_limit: i64) -> Self {
        Self {
            batch_size,
            error_limit,
            exclude_disabled: true,
            next_check_expired: true,
        }
    }
}

//! Outbound collaborators invoked after a successful refresh.

use async_trait::async_trait;
use tracing::debug;

use crate::model::{Entry, Feed, User};

/// Receives newly created entries, for example to forward them to a
/// third-party service.
#[async_trait]
pub trait IntegrationSink: Send + Sync {
    /// Failures stay inside the sink; a refresh never fails because of it.
    async fn push_entries(&self, user: &User, feed: &Feed, entries: &[Entry]);
}

/// Refreshes the stored icon of a feed.
#[async_trait]
pub trait IconUpdater: Send + Sync {
    async fn update_feed_icon(&self, feed: &Feed);
}

/// Sink and updater that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

#[async_trait]
impl IntegrationSink for Noop {
    async fn push_entries(&self, user: &User, feed: &Feed, entries: &[Entry]) {
        debug!(
            user_id = user.id,
            feed_id = feed.id,
            entries = entries.len(),
            "no integration configured"
        );
    }
}

#[async_trait]
impl IconUpdater for Noop {
    async fn update_feed_icon(&self, feed: &Feed) {
        debug!(feed_id = feed.id, icon_url = %feed.icon_url, "icon update skipped");
    }
}

//! Entry processing between parsing and storage.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::RefreshError;
use crate::model::{Entry, Feed, User};
use crate::storage::FeedStore;

/// Words per minute used for reading time estimates.
pub const WORDS_PER_MINUTE: usize = 265;

/// Prepares parsed entries before they are persisted.
#[async_trait]
pub trait EntryProcessor: Send + Sync {
    /// Returns the entries to store, in document order.
    ///
    /// # Errors
    ///
    /// Returns a `Processing` or `Persistence` error; the refresh counts it
    /// as a feed error.
    async fn process_feed_entries(
        &self,
        store: &dyn FeedStore,
        feed: &Feed,
        entries: Vec<Entry>,
        user: &User,
        force: bool,
    ) -> Result<Vec<Entry>, RefreshError>;
}

/// Hashing, in-batch deduplication and reading time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcessor;

#[async_trait]
impl EntryProcessor for DefaultProcessor {
    #[instrument(skip_all, fields(feed_id = feed.id, user_id = user.id))]
    async fn process_feed_entries(
        &self,
        store: &dyn FeedStore,
        feed: &Feed,
        entries: Vec<Entry>,
        user: &User,
        force: bool,
    ) -> Result<Vec<Entry>, RefreshError> {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.hash.is_empty() {
                entry.hash = Entry::compute_hash("", &entry.url, &entry.title, &entry.content);
            }
            if !seen.insert(entry.hash.clone()) {
                continue;
            }
            entry.user_id = user.id;
            entry.feed_id = feed.id;
            kept.push(entry);
        }

        let hashes: Vec<String> = kept.iter().map(|e| e.hash.clone()).collect();
        let known = store
            .known_entry_hashes(feed.id, &hashes)
            .await
            .map_err(RefreshError::persistence)?;

        for entry in &mut kept {
            let stored = if known.contains(&entry.hash) && !force {
                store
                    .get_read_time(feed.id, &entry.hash)
                    .await
                    .map_err(RefreshError::persistence)?
            } else {
                None
            };
            entry.reading_time = stored.unwrap_or_else(|| reading_time(&entry.content));
        }

        debug!(
            entries = kept.len(),
            known = known.len(),
            "processed feed entries"
        );
        Ok(kept)
    }
}

/// Estimated minutes to read `html`, markup excluded. At least one.
#[must_use]
pub fn reading_time(html: &str) -> i64 {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let words = text.split_whitespace().count();
    i64::try_from(words.div_ceil(WORDS_PER_MINUTE).max(1)).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn entry(url: &str, content: &str) -> Entry {
        Entry {
            url: url.to_string(),
            title: url.to_string(),
            content: content.to_string(),
            ..Entry::default()
        }
    }

    #[test]
    fn test_reading_time_ignores_markup() {
        assert_eq!(reading_time(""), 1);
        assert_eq!(reading_time("<p>short</p>"), 1);
        let long = "<p>word</p> ".repeat(WORDS_PER_MINUTE + 1);
        assert_eq!(reading_time(&long), 2);
    }

    #[tokio::test]
    async fn test_dedup_and_ownership() {
        let store = MemoryStore::new();
        let user = User::new(7, "alice", "en_US");
        let feed = Feed {
            id: 3,
            user_id: 7,
            ..Feed::default()
        };

        let entries = vec![
            entry("https://a/1", "x"),
            entry("https://a/1", "x"),
            entry("https://a/2", "y"),
        ];
        let out = DefaultProcessor
            .process_feed_entries(&store, &feed, entries, &user, false)
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.user_id == 7 && e.feed_id == 3));
        assert!(out.iter().all(|e| !e.hash.is_empty()));
    }

    #[tokio::test]
    async fn test_known_entry_keeps_stored_reading_time() {
        let store = MemoryStore::new();
        let user = User::new(1, "alice", "en_US");
        store.insert_user(user.clone());
        let feed_id = store.insert_feed(Feed {
            user_id: user.id,
            feed_url: "https://a/feed".to_string(),
            ..Feed::default()
        });
        let mut known = entry("https://a/1", "x");
        known.hash = Entry::compute_hash("", &known.url, &known.title, &known.content);
        known.reading_time = 42;
        known.user_id = user.id;
        known.feed_id = feed_id;
        store.insert_entry(known);

        let feed = store.feed(feed_id).unwrap();
        let out = DefaultProcessor
            .process_feed_entries(&store, &feed, vec![entry("https://a/1", "x")], &user, false)
            .await
            .unwrap();
        assert_eq!(out[0].reading_time, 42);

        let forced = DefaultProcessor
            .process_feed_entries(&store, &feed, vec![entry("https://a/1", "x")], &user, true)
            .await
            .unwrap();
        assert_eq!(forced[0].reading_time, 1);
    }
}

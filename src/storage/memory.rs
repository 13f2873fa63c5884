//! In-process storage.
//!
//! Backs the engine when embedding without a database and in tests. All
//! state sits behind one mutex; no lock is held across an await.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{BatchSource, CleanupStore, FeedStore, StoreError};
use crate::model::{BatchQuery, Entry, EntryStatus, Feed, Job, RefreshResult, User};

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<i64, User>,
    feeds: BTreeMap<i64, Feed>,
    entries: BTreeMap<i64, Entry>,
    /// `(id, created_at)`.
    sessions: Vec<(String, DateTime<Utc>)>,
    next_feed_id: i64,
    next_entry_id: i64,
}

/// Storage kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    refresh_entries_calls: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    /// Stores `feed`, assigning an id when it has none. Returns the id.
    pub fn insert_feed(&self, mut feed: Feed) -> i64 {
        let mut state = self.lock();
        if feed.id == 0 {
            state.next_feed_id += 1;
            feed.id = state.next_feed_id;
        } else {
            state.next_feed_id = state.next_feed_id.max(feed.id);
        }
        let id = feed.id;
        state.feeds.insert(id, feed);
        id
    }

    /// Stores `entry`, assigning an id when it has none. Returns the id.
    pub fn insert_entry(&self, mut entry: Entry) -> i64 {
        let mut state = self.lock();
        if entry.id == 0 {
            state.next_entry_id += 1;
            entry.id = state.next_entry_id;
        }
        let id = entry.id;
        state.entries.insert(id, entry);
        id
    }

    pub fn insert_session(&self, id: &str, created_at: DateTime<Utc>) {
        self.lock().sessions.push((id.to_string(), created_at));
    }

    /// Snapshot of a stored feed.
    #[must_use]
    pub fn feed(&self, feed_id: i64) -> Option<Feed> {
        self.lock().feeds.get(&feed_id).cloned()
    }

    /// Snapshot of a feed's entries, in insertion order.
    #[must_use]
    pub fn entries(&self, feed_id: i64) -> Vec<Entry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.feed_id == feed_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of `refresh_feed_entries` calls so far.
    #[must_use]
    pub fn refresh_entries_calls(&self) -> usize {
        self.refresh_entries_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn feed_by_id(&self, user_id: i64, feed_id: i64) -> Result<Option<Feed>, StoreError> {
        Ok(self
            .lock()
            .feeds
            .get(&feed_id)
            .filter(|f| f.user_id == user_id)
            .cloned())
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn another_feed_url_exists(
        &self,
        user_id: i64,
        feed_id: i64,
        feed_url: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .feeds
            .values()
            .any(|f| f.user_id == user_id && f.id != feed_id && f.feed_url == feed_url))
    }

    async fn weekly_feed_entry_count(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<i64, StoreError> {
        let since = Utc::now() - TimeDelta::days(7);
        let count = self
            .lock()
            .entries
            .values()
            .filter(|e| {
                e.user_id == user_id
                    && e.feed_id == feed_id
                    && e.published_at.is_some_and(|at| at >= since)
            })
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state
            .feeds
            .get_mut(&feed.id)
            .ok_or_else(|| StoreError::backend(format!("feed {} does not exist", feed.id)))?;
        *stored = feed.clone();
        stored.icon_url.clear();
        Ok(())
    }

    async fn update_feed_error(&self, feed: &Feed) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state
            .feeds
            .get_mut(&feed.id)
            .ok_or_else(|| StoreError::backend(format!("feed {} does not exist", feed.id)))?;
        stored.parsing_error_count = feed.parsing_error_count;
        stored.parsing_error_message.clone_from(&feed.parsing_error_message);
        stored.checked_at = feed.checked_at;
        stored.next_check_at = feed.next_check_at;
        Ok(())
    }

    async fn refresh_feed_entries(
        &self,
        user_id: i64,
        feed_id: i64,
        entries: &[Entry],
        update_existing: bool,
    ) -> Result<RefreshResult, StoreError> {
        self.refresh_entries_calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let mut result = RefreshResult {
            refreshed: true,
            ..RefreshResult::default()
        };

        let mut state = self.lock();
        for entry in entries {
            let existing = state
                .entries
                .values_mut()
                .find(|e| e.feed_id == feed_id && e.hash == entry.hash);
            match existing {
                Some(stored) => {
                    if update_existing {
                        stored.title.clone_from(&entry.title);
                        stored.url.clone_from(&entry.url);
                        stored.author.clone_from(&entry.author);
                        stored.content.clone_from(&entry.content);
                        stored.reading_time = entry.reading_time;
                        stored.changed_at = Some(now);
                        result.updated_entries.push(stored.clone());
                    }
                }
                None => {
                    state.next_entry_id += 1;
                    let created = Entry {
                        id: state.next_entry_id,
                        user_id,
                        feed_id,
                        status: EntryStatus::Unread,
                        changed_at: Some(now),
                        ..entry.clone()
                    };
                    state.entries.insert(created.id, created.clone());
                    result.created_entries.push(created);
                }
            }
        }
        Ok(result)
    }

    async fn known_entry_hashes(
        &self,
        feed_id: i64,
        hashes: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        Ok(self
            .lock()
            .entries
            .values()
            .filter(|e| e.feed_id == feed_id && wanted.contains(e.hash.as_str()))
            .map(|e| e.hash.clone())
            .collect())
    }

    async fn get_read_time(&self, feed_id: i64, hash: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .lock()
            .entries
            .values()
            .find(|e| e.feed_id == feed_id && e.hash == hash)
            .map(|e| e.reading_time))
    }
}

#[async_trait]
impl BatchSource for MemoryStore {
    async fn due_jobs(&self, query: &BatchQuery) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let state = self.lock();
        let mut due: Vec<&Feed> = state
            .feeds
            .values()
            .filter(|f| !query.exclude_disabled || !f.disabled)
            .filter(|f| query.error_limit <= 0 || f.parsing_error_count < query.error_limit)
            .filter(|f| !query.next_check_expired || f.next_check_at <= now)
            .collect();
        due.sort_by_key(|f| (f.next_check_at, f.id));
        let limit = if query.batch_size == 0 {
            usize::MAX
        } else {
            query.batch_size
        };
        Ok(due
            .into_iter()
            .take(limit)
            .map(|f| Job::new(f.user_id, f.id, &f.feed_url))
            .collect())
    }
}

#[async_trait]
impl CleanupStore for MemoryStore {
    async fn archive_read_entries(
        &self,
        older_than_days: i64,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - TimeDelta::days(older_than_days);
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut archived = 0u64;
        let mut state = self.lock();
        for entry in state
            .entries
            .values_mut()
            .filter(|e| e.status == EntryStatus::Read)
            .filter(|e| e.changed_at.or(e.published_at).is_some_and(|at| at < cutoff))
            .take(limit)
        {
            entry.status = EntryStatus::Removed;
            entry.changed_at = Some(now);
            archived += 1;
        }
        Ok(archived)
    }

    async fn delete_expired_sessions(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - TimeDelta::days(older_than_days);
        let mut state = self.lock();
        let before = state.sessions.len();
        state.sessions.retain(|(_, created_at)| *created_at >= cutoff);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn feed(user_id: i64, url: &str) -> Feed {
        Feed {
            user_id,
            feed_url: url.to_string(),
            next_check_at: Utc::now() - TimeDelta::minutes(1),
            ..Feed::default()
        }
    }

    fn entry(hash: &str) -> Entry {
        Entry {
            hash: hash.to_string(),
            title: format!("title {hash}"),
            ..Entry::default()
        }
    }

    #[tokio::test]
    async fn test_feed_by_id_checks_owner() {
        let store = MemoryStore::new();
        let id = store.insert_feed(feed(1, "https://a/feed"));
        assert!(store.feed_by_id(1, id).await.unwrap().is_some());
        assert!(store.feed_by_id(2, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_jobs_filters() {
        let store = MemoryStore::new();
        let due = store.insert_feed(feed(1, "https://a/feed"));
        store.insert_feed(Feed {
            disabled: true,
            ..feed(1, "https://b/feed")
        });
        store.insert_feed(Feed {
            parsing_error_count: 3,
            ..feed(1, "https://c/feed")
        });
        store.insert_feed(Feed {
            next_check_at: Utc::now() + TimeDelta::hours(1),
            ..feed(1, "https://d/feed")
        });

        let jobs = store.due_jobs(&BatchQuery::due(10, 3)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].feed_id, due);
    }

    #[tokio::test]
    async fn test_due_jobs_zero_error_limit_is_unlimited() {
        let store = MemoryStore::new();
        store.insert_feed(Feed {
            parsing_error_count: 50,
            ..feed(1, "https://a/feed")
        });
        let jobs = store.due_jobs(&BatchQuery::due(10, 0)).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_due_jobs_respects_batch_size() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert_feed(feed(1, &format!("https://a/{i}")));
        }
        let jobs = store.due_jobs(&BatchQuery::due(3, 0)).await.unwrap();
        assert_eq!(jobs.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_entries_creates_then_updates() {
        let store = MemoryStore::new();
        let id = store.insert_feed(feed(1, "https://a/feed"));

        let first = store
            .refresh_feed_entries(1, id, &[entry("h1"), entry("h2")], true)
            .await
            .unwrap();
        assert_eq!(first.created_len(), 2);
        assert_eq!(first.updated_len(), 0);

        let second = store
            .refresh_feed_entries(1, id, &[entry("h1"), entry("h3")], true)
            .await
            .unwrap();
        assert_eq!(second.created_len(), 1);
        assert_eq!(second.updated_len(), 1);

        let third = store
            .refresh_feed_entries(1, id, &[entry("h1")], false)
            .await
            .unwrap();
        assert_eq!(third.created_len(), 0);
        assert_eq!(third.updated_len(), 0);
        assert_eq!(store.entries(id).len(), 3);
        assert_eq!(store.refresh_entries_calls(), 3);
    }

    #[tokio::test]
    async fn test_known_hashes_and_read_time() {
        let store = MemoryStore::new();
        let id = store.insert_feed(feed(1, "https://a/feed"));
        store.insert_entry(Entry {
            feed_id: id,
            reading_time: 4,
            ..entry("h1")
        });

        let known = store
            .known_entry_hashes(id, &["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        assert_eq!(known, HashSet::from(["h1".to_string()]));
        assert_eq!(store.get_read_time(id, "h1").await.unwrap(), Some(4));
        assert_eq!(store.get_read_time(id, "h2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_another_feed_url_exists() {
        let store = MemoryStore::new();
        let a = store.insert_feed(feed(1, "https://a/feed"));
        let b = store.insert_feed(feed(1, "https://b/feed"));
        store.insert_feed(feed(2, "https://c/feed"));

        assert!(store.another_feed_url_exists(1, b, "https://a/feed").await.unwrap());
        assert!(!store.another_feed_url_exists(1, a, "https://a/feed").await.unwrap());
        assert!(!store.another_feed_url_exists(1, a, "https://c/feed").await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_read_entries_respects_limit() {
        let store = MemoryStore::new();
        let old = Utc::now() - TimeDelta::days(90);
        for i in 0..3 {
            store.insert_entry(Entry {
                feed_id: 1,
                status: EntryStatus::Read,
                changed_at: Some(old),
                ..entry(&format!("h{i}"))
            });
        }
        store.insert_entry(Entry {
            feed_id: 1,
            status: EntryStatus::Unread,
            changed_at: Some(old),
            ..entry("unread")
        });

        assert_eq!(store.archive_read_entries(60, 2).await.unwrap(), 2);
        assert_eq!(store.archive_read_entries(60, 10).await.unwrap(), 1);
        assert_eq!(store.archive_read_entries(60, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_expired_sessions() {
        let store = MemoryStore::new();
        store.insert_session("old", Utc::now() - TimeDelta::days(40));
        store.insert_session("new", Utc::now());
        assert_eq!(store.delete_expired_sessions(30).await.unwrap(), 1);
        assert_eq!(store.session_count(), 1);
    }
}

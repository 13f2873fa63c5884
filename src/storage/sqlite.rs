//! `SQLite` storage through sqlx.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::instrument;

use super::{BatchSource, CleanupStore, FeedStore, StoreError};
use crate::db::Database;
use crate::model::{
    BatchQuery, ContentFingerprint, Entry, EntryStatus, Feed, Job, RefreshResult, User,
};

const FEED_COLUMNS: &str = "id, user_id, feed_url, site_url, title, username, password, cookie, \
    user_agent, proxy_url, fetch_via_proxy, allow_self_signed_certificates, disable_http2, \
    ignore_http_cache, crawler, disabled, etag_header, last_modified_header, content_hash, \
    content_size, parsing_error_count, parsing_error_message, checked_at, next_check_at";

const ENTRY_COLUMNS: &str = "id, user_id, feed_id, status, hash, title, url, author, content, \
    published_at, changed_at, reading_time";

/// Storage backed by a [`Database`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    /// Inserts a user, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn insert_user(&self, username: &str, language: &str) -> Result<i64, StoreError> {
        let id = sqlx::query("INSERT INTO users (username, language) VALUES (?, ?)")
            .bind(username)
            .bind(language)
            .execute(self.pool())
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    /// Inserts a feed subscription, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure, including a
    /// duplicate `(user_id, feed_url)`.
    pub async fn insert_feed(&self, feed: &Feed) -> Result<i64, StoreError> {
        let id = sqlx::query(
            "INSERT INTO feeds (user_id, feed_url, site_url, title, username, password, cookie, \
             user_agent, proxy_url, fetch_via_proxy, allow_self_signed_certificates, \
             disable_http2, ignore_http_cache, crawler, disabled, next_check_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(feed.user_id)
        .bind(&feed.feed_url)
        .bind(&feed.site_url)
        .bind(&feed.title)
        .bind(&feed.username)
        .bind(&feed.password)
        .bind(&feed.cookie)
        .bind(&feed.user_agent)
        .bind(&feed.proxy_url)
        .bind(feed.fetch_via_proxy)
        .bind(feed.allow_self_signed_certificates)
        .bind(feed.disable_http2)
        .bind(feed.ignore_http_cache)
        .bind(feed.crawler)
        .bind(feed.disabled)
        .bind(feed.next_check_at)
        .execute(self.pool())
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Records a login session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    pub async fn insert_session(
        &self,
        id: &str,
        user_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sessions (id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(user_id)
            .bind(created_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All entries of a feed, by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or mapping failure.
    pub async fn entries(&self, feed_id: i64) -> Result<Vec<Entry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? ORDER BY id"
        ))
        .bind(feed_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn feed_from_row(row: &SqliteRow) -> Result<Feed, StoreError> {
    let content_size: i64 = row.try_get("content_size")?;
    Ok(Feed {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        feed_url: row.try_get("feed_url")?,
        site_url: row.try_get("site_url")?,
        title: row.try_get("title")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        cookie: row.try_get("cookie")?,
        user_agent: row.try_get("user_agent")?,
        proxy_url: row.try_get("proxy_url")?,
        fetch_via_proxy: row.try_get("fetch_via_proxy")?,
        allow_self_signed_certificates: row.try_get("allow_self_signed_certificates")?,
        disable_http2: row.try_get("disable_http2")?,
        ignore_http_cache: row.try_get("ignore_http_cache")?,
        crawler: row.try_get("crawler")?,
        disabled: row.try_get("disabled")?,
        etag_header: row.try_get("etag_header")?,
        last_modified_header: row.try_get("last_modified_header")?,
        content: ContentFingerprint {
            hash: row.try_get("content_hash")?,
            size: u64::try_from(content_size)
                .map_err(|_| StoreError::corrupt("content_size", content_size.to_string()))?,
        },
        parsing_error_count: row.try_get("parsing_error_count")?,
        parsing_error_message: row.try_get("parsing_error_message")?,
        checked_at: row.try_get("checked_at")?,
        next_check_at: row.try_get("next_check_at")?,
        icon_url: String::new(),
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<Entry, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Entry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        feed_id: row.try_get("feed_id")?,
        status: status
            .parse::<EntryStatus>()
            .map_err(|_| StoreError::corrupt("status", status.clone()))?,
        hash: row.try_get("hash")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        author: row.try_get("author")?,
        content: row.try_get("content")?,
        published_at: row.try_get("published_at")?,
        changed_at: row.try_get("changed_at")?,
        reading_time: row.try_get("reading_time")?,
    })
}

#[async_trait]
impl FeedStore for SqliteStore {
    #[instrument(skip(self))]
    async fn feed_by_id(&self, user_id: i64, feed_id: i64) -> Result<Option<Feed>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ? AND user_id = ?"
        ))
        .bind(feed_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(feed_from_row).transpose()
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT id, username, language FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|row| -> Result<User, StoreError> {
            Ok(User {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                language: row.try_get("language")?,
            })
        })
        .transpose()
    }

    async fn another_feed_url_exists(
        &self,
        user_id: i64,
        feed_id: i64,
        feed_url: &str,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM feeds WHERE user_id = ? AND id <> ? AND feed_url = ?)",
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(feed_url)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn weekly_feed_entry_count(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<i64, StoreError> {
        let since = Utc::now() - TimeDelta::days(7);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entries WHERE user_id = ? AND feed_id = ? AND published_at >= ?",
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    #[instrument(skip(self, feed), fields(feed_id = feed.id))]
    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let content_size = i64::try_from(feed.content.size)
            .map_err(|_| StoreError::corrupt("content_size", feed.content.size.to_string()))?;
        let result = sqlx::query(
            "UPDATE feeds SET feed_url = ?, site_url = ?, title = ?, etag_header = ?, \
             last_modified_header = ?, content_hash = ?, content_size = ?, \
             parsing_error_count = ?, parsing_error_message = ?, checked_at = ?, \
             next_check_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(&feed.feed_url)
        .bind(&feed.site_url)
        .bind(&feed.title)
        .bind(&feed.etag_header)
        .bind(&feed.last_modified_header)
        .bind(&feed.content.hash)
        .bind(content_size)
        .bind(feed.parsing_error_count)
        .bind(&feed.parsing_error_message)
        .bind(feed.checked_at)
        .bind(feed.next_check_at)
        .bind(feed.id)
        .bind(feed.user_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::backend(format!("feed {} does not exist", feed.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, feed), fields(feed_id = feed.id))]
    async fn update_feed_error(&self, feed: &Feed) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE feeds SET parsing_error_count = ?, parsing_error_message = ?, \
             checked_at = ?, next_check_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(feed.parsing_error_count)
        .bind(&feed.parsing_error_message)
        .bind(feed.checked_at)
        .bind(feed.next_check_at)
        .bind(feed.id)
        .bind(feed.user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn refresh_feed_entries(
        &self,
        user_id: i64,
        feed_id: i64,
        entries: &[Entry],
        update_existing: bool,
    ) -> Result<RefreshResult, StoreError> {
        let now = Utc::now();
        let mut result = RefreshResult {
            refreshed: true,
            ..RefreshResult::default()
        };

        let mut tx = self.pool().begin().await?;
        for entry in entries {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM entries WHERE feed_id = ? AND hash = ?")
                    .bind(feed_id)
                    .bind(&entry.hash)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing {
                Some(id) => {
                    if !update_existing {
                        continue;
                    }
                    sqlx::query(
                        "UPDATE entries SET title = ?, url = ?, author = ?, content = ?, \
                         reading_time = ?, changed_at = ? WHERE id = ?",
                    )
                    .bind(&entry.title)
                    .bind(&entry.url)
                    .bind(&entry.author)
                    .bind(&entry.content)
                    .bind(entry.reading_time)
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    result.updated_entries.push(Entry {
                        id,
                        user_id,
                        feed_id,
                        changed_at: Some(now),
                        ..entry.clone()
                    });
                }
                None => {
                    let id = sqlx::query(
                        "INSERT INTO entries (user_id, feed_id, status, hash, title, url, author, \
                         content, published_at, changed_at, reading_time) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(user_id)
                    .bind(feed_id)
                    .bind(EntryStatus::Unread.as_str())
                    .bind(&entry.hash)
                    .bind(&entry.title)
                    .bind(&entry.url)
                    .bind(&entry.author)
                    .bind(&entry.content)
                    .bind(entry.published_at)
                    .bind(now)
                    .bind(entry.reading_time)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid();
                    result.created_entries.push(Entry {
                        id,
                        user_id,
                        feed_id,
                        status: EntryStatus::Unread,
                        changed_at: Some(now),
                        ..entry.clone()
                    });
                }
            }
        }
        tx.commit().await?;
        Ok(result)
    }

    async fn known_entry_hashes(
        &self,
        feed_id: i64,
        hashes: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql = format!("SELECT hash FROM entries WHERE feed_id = ? AND hash IN ({placeholders})");
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(feed_id);
        for hash in hashes {
            query = query.bind(hash);
        }
        Ok(query.fetch_all(self.pool()).await?.into_iter().collect())
    }

    async fn get_read_time(&self, feed_id: i64, hash: &str) -> Result<Option<i64>, StoreError> {
        let reading_time: Option<i64> =
            sqlx::query_scalar("SELECT reading_time FROM entries WHERE feed_id = ? AND hash = ?")
                .bind(feed_id)
                .bind(hash)
                .fetch_optional(self.pool())
                .await?;
        Ok(reading_time)
    }
}

#[async_trait]
impl BatchSource for SqliteStore {
    #[instrument(skip(self))]
    async fn due_jobs(&self, query: &BatchQuery) -> Result<Vec<Job>, StoreError> {
        let mut sql = String::from("SELECT id, user_id, feed_url FROM feeds WHERE 1 = 1");
        if query.exclude_disabled {
            sql.push_str(" AND disabled = 0");
        }
        if query.error_limit > 0 {
            sql.push_str(" AND parsing_error_count < ?");
        }
        if query.next_check_expired {
            sql.push_str(" AND next_check_at <= ?");
        }
        sql.push_str(" ORDER BY next_check_at, id");
        if query.batch_size > 0 {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql);
        if query.error_limit > 0 {
            q = q.bind(query.error_limit);
        }
        if query.next_check_expired {
            q = q.bind(Utc::now());
        }
        if query.batch_size > 0 {
            q = q.bind(i64::try_from(query.batch_size).unwrap_or(i64::MAX));
        }

        let rows = q.fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| -> Result<Job, StoreError> {
                Ok(Job::new(
                    row.try_get::<i64, _>("user_id")?,
                    row.try_get::<i64, _>("id")?,
                    row.try_get::<String, _>("feed_url")?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl CleanupStore for SqliteStore {
    #[instrument(skip(self))]
    async fn archive_read_entries(
        &self,
        older_than_days: i64,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = now - TimeDelta::days(older_than_days);
        let result = sqlx::query(
            "UPDATE entries SET status = 'removed', changed_at = ? WHERE id IN (\
             SELECT id FROM entries WHERE status = 'read' \
             AND COALESCE(changed_at, published_at) < ? LIMIT ?)",
        )
        .bind(now)
        .bind(cutoff)
        .bind(limit)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_expired_sessions(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - TimeDelta::days(older_than_days);
        let result = sqlx::query("DELETE FROM sessions WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new_in_memory().await.unwrap())
    }

    fn feed(user_id: i64, url: &str) -> Feed {
        Feed {
            user_id,
            feed_url: url.to_string(),
            next_check_at: Utc::now() - TimeDelta::minutes(5),
            ..Feed::default()
        }
    }

    fn entry(hash: &str) -> Entry {
        Entry {
            hash: hash.to_string(),
            title: format!("title {hash}"),
            published_at: Some(Utc::now()),
            ..Entry::default()
        }
    }

    #[tokio::test]
    async fn test_feed_round_trip_through_update() {
        let store = store().await;
        let user = store.insert_user("alice", "fr_FR").await.unwrap();
        let id = store.insert_feed(&feed(user, "https://a/feed")).await.unwrap();

        let mut loaded = store.feed_by_id(user, id).await.unwrap().unwrap();
        loaded.etag_header = "\"abc\"".to_string();
        loaded.content = ContentFingerprint::of(b"<rss/>");
        loaded.parsing_error_count = 2;
        loaded.checked_at = Some(Utc::now());
        store.update_feed(&loaded).await.unwrap();

        let reloaded = store.feed_by_id(user, id).await.unwrap().unwrap();
        assert_eq!(reloaded.etag_header, "\"abc\"");
        assert_eq!(reloaded.content, loaded.content);
        assert_eq!(reloaded.parsing_error_count, 2);
        assert!(reloaded.checked_at.is_some());

        let user = store.user_by_id(user).await.unwrap().unwrap();
        assert_eq!(user.language, "fr_FR");
    }

    #[tokio::test]
    async fn test_feed_by_id_other_user_is_none() {
        let store = store().await;
        let user = store.insert_user("alice", "en_US").await.unwrap();
        let id = store.insert_feed(&feed(user, "https://a/feed")).await.unwrap();
        assert!(store.feed_by_id(user + 1, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_jobs_filters() {
        let store = store().await;
        let user = store.insert_user("alice", "en_US").await.unwrap();
        let due = store.insert_feed(&feed(user, "https://a/feed")).await.unwrap();
        store
            .insert_feed(&Feed {
                disabled: true,
                ..feed(user, "https://b/feed")
            })
            .await
            .unwrap();
        store
            .insert_feed(&Feed {
                next_check_at: Utc::now() + TimeDelta::hours(2),
                ..feed(user, "https://c/feed")
            })
            .await
            .unwrap();
        let erroring = store.insert_feed(&feed(user, "https://d/feed")).await.unwrap();
        let mut erroring = store.feed_by_id(user, erroring).await.unwrap().unwrap();
        erroring.parsing_error_count = 3;
        store.update_feed_error(&erroring).await.unwrap();

        let jobs = store.due_jobs(&BatchQuery::due(10, 3)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].feed_id, due);
        assert_eq!(jobs[0].feed_url, "https://a/feed");
    }

    #[tokio::test]
    async fn test_refresh_entries_insert_and_update() {
        let store = store().await;
        let user = store.insert_user("alice", "en_US").await.unwrap();
        let id = store.insert_feed(&feed(user, "https://a/feed")).await.unwrap();

        let first = store
            .refresh_feed_entries(user, id, &[entry("h1"), entry("h2")], false)
            .await
            .unwrap();
        assert_eq!(first.created_len(), 2);

        let mut changed = entry("h1");
        changed.title = "new title".to_string();
        let skipped = store
            .refresh_feed_entries(user, id, &[changed.clone()], false)
            .await
            .unwrap();
        assert_eq!(skipped.updated_len(), 0);

        let updated = store
            .refresh_feed_entries(user, id, &[changed], true)
            .await
            .unwrap();
        assert_eq!(updated.updated_len(), 1);

        let entries = store.entries(id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "new title");
        assert_eq!(store.weekly_feed_entry_count(user, id).await.unwrap(), 2);

        let known = store
            .known_entry_hashes(id, &["h1".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(known.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let store = store().await;
        let user = store.insert_user("alice", "en_US").await.unwrap();
        store
            .insert_session("old", user, Utc::now() - TimeDelta::days(45))
            .await
            .unwrap();
        store.insert_session("fresh", user, Utc::now()).await.unwrap();
        assert_eq!(store.delete_expired_sessions(30).await.unwrap(), 1);

        let id = store.insert_feed(&feed(user, "https://a/feed")).await.unwrap();
        store
            .refresh_feed_entries(user, id, &[entry("h1")], false)
            .await
            .unwrap();
        sqlx::query("UPDATE entries SET status = 'read', changed_at = ?")
            .bind(Utc::now() - TimeDelta::days(90))
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.archive_read_entries(60, 100).await.unwrap(), 1);
        let entries = store.entries(id).await.unwrap();
        assert_eq!(entries[0].status, EntryStatus::Removed);
    }
}

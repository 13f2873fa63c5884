//! Single-feed refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::RefreshError;
use crate::fetch::{RequestBuilder, RequestOptions, ResponseHandler};
use crate::model::{Feed, Job, NotModifiedReason, RefreshResult, User};
use crate::reader::{
    DefaultProcessor, EntryProcessor, FeedParser, FeedRsParser, IconUpdater, IntegrationSink, Noop,
};
use crate::schedule::NextCheckScheduler;
use crate::storage::FeedStore;
use crate::worker::JobHandler;

/// Fetches, parses and persists one feed at a time.
///
/// Every attempt ends with the feed row persisted exactly once: through
/// `update_feed` on success or not-modified, through `update_feed_error` on a
/// counted failure.
pub struct FeedRefresher {
    config: Arc<Config>,
    store: Arc<dyn FeedStore>,
    requests: Arc<RequestBuilder>,
    parser: Arc<dyn FeedParser>,
    processor: Arc<dyn EntryProcessor>,
    integrations: Arc<dyn IntegrationSink>,
    icons: Arc<dyn IconUpdater>,
    scheduler: NextCheckScheduler,
}

impl std::fmt::Debug for FeedRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedRefresher")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl FeedRefresher {
    /// Creates a refresher with the default parser and processor and no-op
    /// integrations.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn FeedStore>,
        requests: Arc<RequestBuilder>,
    ) -> Self {
        let scheduler = NextCheckScheduler::from_config(&config);
        Self {
            config,
            store,
            requests,
            parser: Arc::new(FeedRsParser),
            processor: Arc::new(DefaultProcessor),
            integrations: Arc::new(Noop),
            icons: Arc::new(Noop),
            scheduler,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn FeedParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn EntryProcessor>) -> Self {
        self.processor = processor;
        self
    }

    #[must_use]
    pub fn with_integrations(mut self, integrations: Arc<dyn IntegrationSink>) -> Self {
        self.integrations = integrations;
        self
    }

    #[must_use]
    pub fn with_icon_updater(mut self, icons: Arc<dyn IconUpdater>) -> Self {
        self.icons = icons;
        self
    }

    /// Refreshes one feed.
    ///
    /// `force` skips conditional headers and the body fingerprint check, lets
    /// crawler feeds overwrite stored entries and refreshes the icon.
    ///
    /// # Errors
    ///
    /// Returns the localized [`RefreshError`] of the attempt. Errors that
    /// count against the feed have already been recorded on it when this
    /// returns.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_feed(
        &self,
        user_id: i64,
        feed_id: i64,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RefreshResult, RefreshError> {
        let started = Instant::now();

        let mut feed = self
            .store
            .feed_by_id(user_id, feed_id)
            .await
            .map_err(RefreshError::persistence)?
            .ok_or_else(RefreshError::not_found)?;
        let user = self
            .store
            .user_by_id(user_id)
            .await
            .map_err(RefreshError::persistence)?
            .ok_or_else(RefreshError::not_found)?;

        let weekly_count = if self.scheduler.uses_entry_frequency() {
            self.store
                .weekly_feed_entry_count(user_id, feed_id)
                .await
                .map_err(RefreshError::persistence)?
        } else {
            0
        };

        feed.checked_now();
        feed.next_check_at = self.scheduler.next_check_at(Utc::now(), weekly_count, 0);

        let options = RequestOptions::for_feed(&feed, force);
        let semaphore = match self.requests.execute(&feed.feed_url, &options, cancel).await {
            Ok(semaphore) => semaphore,
            Err(err) => return Err(self.record_error(&mut feed, &user, err).await),
        };

        let mut response = ResponseHandler::new(semaphore);
        let outcome = self
            .handle_response(&mut feed, &user, &mut response, weekly_count, force, cancel)
            .await;
        response.close().await;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => return Err(self.record_error(&mut feed, &user, err).await),
        };

        feed.reset_error_counter();
        if let Err(source) = self.store.update_feed(&feed).await {
            let err = RefreshError::persistence(source);
            feed.with_translated_error_message(err.translate(&user.language));
            if let Err(secondary) = self.store.update_feed_error(&feed).await {
                warn!(feed_id, error = %secondary, "unable to record feed error");
            }
            return Err(err);
        }

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let storage_ms = result.storage_elapsed.as_millis() as u64;
        info!(
            feed_id,
            user_id,
            outcome = outcome_label(&result),
            created = result.created_len(),
            updated = result.updated_len(),
            next_check_at = %feed.next_check_at,
            elapsed_ms,
            storage_ms,
            "feed refreshed"
        );
        Ok(result)
    }

    async fn handle_response(
        &self,
        feed: &mut Feed,
        user: &User,
        response: &mut ResponseHandler,
        weekly_count: i64,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RefreshResult, RefreshError> {
        if response.is_rate_limited() {
            let retry_delay = response.parse_retry_delay();
            feed.next_check_at =
                self.scheduler
                    .next_check_at(Utc::now(), weekly_count, minutes_ceil(retry_delay));
            warn!(
                feed_id = feed.id,
                retry_after_secs = retry_delay.as_secs(),
                next_check_at = %feed.next_check_at,
                "feed is rate limited"
            );
        }

        if let Some(err) = response.localized_error() {
            return Err(err);
        }

        let effective_url = response.effective_url().to_string();
        if effective_url != feed.feed_url
            && self
                .store
                .another_feed_url_exists(user.id, feed.id, &effective_url)
                .await
                .map_err(RefreshError::persistence)?
        {
            return Err(RefreshError::duplicate_feed(effective_url));
        }

        let refresh_anyway = feed.ignore_http_cache || force;
        if !refresh_anyway
            && !response.is_modified(&feed.etag_header, &feed.last_modified_header)
        {
            let last_modified = response.last_modified();
            if !last_modified.is_empty() && last_modified != feed.last_modified_header {
                debug!(feed_id = feed.id, last_modified, "storing revalidated Last-Modified");
                feed.last_modified_header = last_modified.to_string();
            }
            return Ok(RefreshResult::not_modified(NotModifiedReason::Headers));
        }

        let max_body = self.config.http_client_max_body_size();
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RefreshError::cancelled()),
            body = response.read_body(max_body) => body?,
        };

        if !feed.content_changed(&body) && !force {
            debug!(feed_id = feed.id, size = body.len(), "feed body unchanged");
            store_validators(feed, response);
            return Ok(RefreshResult::not_modified(NotModifiedReason::Content));
        }

        let parsed = self.parser.parse(&effective_url, &body)?;
        let refresh_delay = parsed
            .ttl_minutes
            .max(response.cache_control_max_age_in_minutes())
            .max(response.expires_in_minutes());
        feed.next_check_at = self
            .scheduler
            .next_check_at(Utc::now(), weekly_count, refresh_delay);
        feed.icon_url = parsed.icon_url;

        let entries = self
            .processor
            .process_feed_entries(self.store.as_ref(), feed, parsed.entries, user, force)
            .await?;

        let update_existing = force || !feed.crawler;
        let storage_started = Instant::now();
        let mut result = self
            .store
            .refresh_feed_entries(user.id, feed.id, &entries, update_existing)
            .await
            .map_err(RefreshError::persistence)?;
        result.storage_elapsed = storage_started.elapsed();
        result.refreshed = true;

        if !result.created_entries.is_empty() {
            self.integrations
                .push_entries(user, feed, &result.created_entries)
                .await;
        }

        store_validators(feed, response);
        if force {
            self.icons.update_feed_icon(feed).await;
        }
        Ok(result)
    }

    /// Records a counted error on the feed and hands it back.
    async fn record_error(&self, feed: &mut Feed, user: &User, err: RefreshError) -> RefreshError {
        if !err.counts_as_feed_error() {
            debug!(feed_id = feed.id, error = %err, "refresh interrupted");
            return err;
        }

        feed.with_translated_error_message(err.translate(&user.language));
        warn!(
            feed_id = feed.id,
            user_id = user.id,
            error_count = feed.parsing_error_count,
            error = %err,
            "feed refresh failed"
        );
        if let Err(store_err) = self.store.update_feed_error(feed).await {
            warn!(feed_id = feed.id, error = %store_err, "unable to record feed error");
        }
        err
    }
}

#[async_trait]
impl JobHandler for FeedRefresher {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<RefreshResult, RefreshError> {
        self.refresh_feed(job.user_id, job.feed_id, false, cancel).await
    }
}

fn store_validators(feed: &mut Feed, response: &ResponseHandler) {
    feed.etag_header = response.etag().to_string();
    feed.last_modified_header = response.last_modified().to_string();
}

fn minutes_ceil(delay: Duration) -> i64 {
    i64::try_from(delay.as_secs().div_ceil(60)).unwrap_or(i64::MAX)
}

fn outcome_label(result: &RefreshResult) -> &'static str {
    match result.not_modified {
        NotModifiedReason::Headers => "not_modified_headers",
        NotModifiedReason::Content => "not_modified_content",
        NotModifiedReason::None if result.refreshed => "refreshed",
        NotModifiedReason::None => "unchanged",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fetch::HostConcurrencyLimiter;
    use crate::storage::MemoryStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
<item><guid>1</guid><title>One</title><link>https://example.com/1</link></item>
</channel></rss>"#;

    fn refresher(store: Arc<MemoryStore>) -> FeedRefresher {
        let config = Arc::new(Config::default());
        let limiter = Arc::new(HostConcurrencyLimiter::new(Arc::clone(&config)));
        let requests = Arc::new(RequestBuilder::new(Arc::clone(&config), limiter));
        FeedRefresher::new(config, store, requests)
    }

    fn seed(store: &MemoryStore, feed_url: String) -> i64 {
        store.insert_user(User::new(1, "alice", "fr_FR"));
        store.insert_feed(Feed {
            user_id: 1,
            feed_url,
            ..Feed::default()
        })
    }

    #[tokio::test]
    async fn test_missing_feed_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = refresher(Arc::clone(&store))
            .refresh_feed(1, 99, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_new_entries_are_stored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .set_body_string(RSS),
            )
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let feed_id = seed(&store, format!("{}/feed", server.uri()));
        let result = refresher(Arc::clone(&store))
            .refresh_feed(1, feed_id, false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.refreshed);
        assert_eq!(result.created_len(), 1);
        let feed = store.feed(feed_id).unwrap();
        assert_eq!(feed.etag_header, "\"v1\"");
        assert_eq!(feed.parsing_error_count, 0);
        assert!(feed.checked_at.is_some());
        assert_eq!(store.entries(feed_id).len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_is_translated_and_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let feed_id = seed(&store, format!("{}/feed", server.uri()));
        let err = refresher(Arc::clone(&store))
            .refresh_feed(1, feed_id, false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HttpStatus);
        let feed = store.feed(feed_id).unwrap();
        assert_eq!(feed.parsing_error_count, 1);
        assert_eq!(feed.parsing_error_message, err.translate("fr_FR"));
    }

    #[tokio::test]
    async fn test_force_skips_conditional_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let feed_id = seed(&store, format!("{}/feed", server.uri()));
        let mut feed = store.feed(feed_id).unwrap();
        feed.etag_header = "\"abc\"".to_string();
        store.insert_feed(feed);

        let refresher = refresher(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let conditional = refresher.refresh_feed(1, feed_id, false, &cancel).await.unwrap();
        assert_eq!(conditional.not_modified, NotModifiedReason::Headers);

        let forced = refresher.refresh_feed(1, feed_id, true, &cancel).await.unwrap();
        assert!(forced.refreshed);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_is_not_counted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let feed_id = seed(&store, format!("{}/feed", server.uri()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = refresher(Arc::clone(&store))
            .refresh_feed(1, feed_id, false, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(store.feed(feed_id).unwrap().parsing_error_count, 0);
    }

    #[test]
    fn test_minutes_ceil() {
        assert_eq!(minutes_ceil(Duration::ZERO), 0);
        assert_eq!(minutes_ceil(Duration::from_secs(61)), 2);
        assert_eq!(minutes_ceil(Duration::from_secs(120)), 2);
    }
}

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;

use refresher_core::fetch::{HostConcurrencyLimiter, RequestBuilder};
use refresher_core::{Config, Feed, FeedRefresher, MemoryStore, User};

/// A minimal RSS document with `items` entries.
pub fn rss(items: usize) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Fixture</title><link>https://example.com/</link>"#,
    );
    for n in 0..items {
        body.push_str(&format!(
            "<item><guid>urn:fixture:{n}</guid><title>Item {n}</title><link>https://example.com/{n}</link><description>Body {n}</description></item>"
        ));
    }
    body.push_str("</channel></rss>");
    body
}

/// Gzip-compresses `body` for `Content-Encoding: gzip` responses.
pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Builds a refresher over `store` with its own limiter and client cache.
pub fn refresher(config: Config, store: Arc<MemoryStore>) -> FeedRefresher {
    let config = Arc::new(config);
    let limiter = Arc::new(HostConcurrencyLimiter::new(Arc::clone(&config)));
    let requests = Arc::new(RequestBuilder::new(Arc::clone(&config), limiter));
    FeedRefresher::new(config, store, requests)
}

/// Inserts user 1 (`language`) and a feed pointing at `feed_url`.
pub fn seed(store: &MemoryStore, language: &str, feed: Feed) -> i64 {
    store.insert_user(User::new(1, "alice", language));
    store.insert_feed(Feed { user_id: 1, ..feed })
}

pub fn feed(feed_url: impl Into<String>) -> Feed {
    Feed {
        feed_url: feed_url.into(),
        ..Feed::default()
    }
}

//! Feed subscription state as seen by the refresh engine.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// A subscribed feed.
///
/// A `Feed` is loaded at the start of a refresh, owned by that refresh for its
/// whole duration and persisted once at the end of the attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub user_id: i64,
    pub feed_url: String,
    pub site_url: String,
    pub title: String,

    // Fetch configuration.
    pub username: String,
    pub password: String,
    pub cookie: String,
    pub user_agent: String,
    pub proxy_url: String,
    pub fetch_via_proxy: bool,
    pub allow_self_signed_certificates: bool,
    pub disable_http2: bool,
    pub ignore_http_cache: bool,
    pub crawler: bool,
    pub disabled: bool,

    // Cache validators from the last modified response.
    pub etag_header: String,
    pub last_modified_header: String,

    /// Fingerprint of the last body that went through the parser.
    pub content: ContentFingerprint,

    pub parsing_error_count: i64,
    pub parsing_error_message: String,

    pub checked_at: Option<DateTime<Utc>>,
    pub next_check_at: DateTime<Utc>,

    /// Icon URL advertised by the last parsed document. Not persisted.
    pub icon_url: String,
}

/// Hash and size of a response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFingerprint {
    /// Lowercase hex SHA-256 of the body, empty when never fetched.
    pub hash: String,
    pub size: u64,
}

impl ContentFingerprint {
    /// Computes the fingerprint of `body`.
    #[must_use]
    pub fn of(body: &[u8]) -> Self {
        let digest = Sha256::digest(body);
        let hash = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self {
            hash,
            size: body.len() as u64,
        }
    }
}

impl Feed {
    /// Records the check time and fills in a missing site URL.
    pub fn checked_now(&mut self) {
        self.checked_at = Some(Utc::now());
        if self.site_url.is_empty() {
            self.site_url.clone_from(&self.feed_url);
        }
    }

    /// Stores a translated error message and bumps the error counter.
    pub fn with_translated_error_message(&mut self, message: String) {
        self.parsing_error_count += 1;
        self.parsing_error_message = message;
    }

    pub fn reset_error_counter(&mut self) {
        self.parsing_error_count = 0;
        self.parsing_error_message.clear();
    }

    /// Replaces the stored fingerprint with the one of `body`.
    ///
    /// Returns `true` when the new fingerprint differs from the previous one.
    pub fn content_changed(&mut self, body: &[u8]) -> bool {
        let fingerprint = ContentFingerprint::of(body);
        let changed = fingerprint != self.content;
        self.content = fingerprint;
        changed
    }

    /// Returns the hostname the feed is fetched from, if the URL parses.
    #[must_use]
    pub fn hostname(&self) -> Option<String> {
        url::Url::parse(&self.feed_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }
}

//! Interpretation of feed responses.
//!
//! [`ResponseHandler`] answers the questions the refresher asks of a
//! response: which validators to store, how long the server wants the
//! content cached, whether anything changed, and whether the server asked us
//! to back off. It also reads the body under a size cap.

use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{
    CACHE_CONTROL, CONTENT_LENGTH, ETAG, EXPIRES, HeaderMap, LAST_MODIFIED, RETRY_AFTER,
};
use tracing::{debug, instrument};

use super::semaphore::ResponseSemaphore;
use crate::error::RefreshError;

/// A received response and the host slot it holds.
#[derive(Debug)]
pub struct ResponseHandler {
    status: StatusCode,
    headers: HeaderMap,
    effective_url: String,
    semaphore: Option<ResponseSemaphore>,
}

impl ResponseHandler {
    /// Takes ownership of a fetched response.
    #[must_use]
    pub fn new(semaphore: ResponseSemaphore) -> Self {
        let (status, headers, effective_url) = semaphore.response().map_or_else(
            || (StatusCode::OK, HeaderMap::new(), String::new()),
            |response| {
                (
                    response.status(),
                    response.headers().clone(),
                    response.url().to_string(),
                )
            },
        );
        Self {
            status,
            headers,
            effective_url,
            semaphore: Some(semaphore),
        }
    }

    /// Builds a handler without a body, for header-only decisions.
    #[must_use]
    pub fn from_parts(status: StatusCode, headers: HeaderMap, effective_url: &str) -> Self {
        Self {
            status,
            headers,
            effective_url: effective_url.to_string(),
            semaphore: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// URL after redirects.
    #[must_use]
    pub fn effective_url(&self) -> &str {
        &self.effective_url
    }

    fn header(&self, name: reqwest::header::HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map_or("", str::trim)
    }

    /// `Expires: 0` means the server forbids caching, validators included.
    fn caching_disabled(&self) -> bool {
        self.header(EXPIRES) == "0"
    }

    /// `ETag` header, empty when absent or when caching is disabled.
    #[must_use]
    pub fn etag(&self) -> &str {
        if self.caching_disabled() {
            return "";
        }
        self.header(ETAG)
    }

    /// `Last-Modified` header, empty when absent or when caching is disabled.
    #[must_use]
    pub fn last_modified(&self) -> &str {
        if self.caching_disabled() {
            return "";
        }
        self.header(LAST_MODIFIED)
    }

    /// Minutes until `Expires`, rounded up. 0 when absent, invalid or past.
    #[must_use]
    pub fn expires_in_minutes(&self) -> i64 {
        let Ok(expires) = httpdate::parse_http_date(self.header(EXPIRES)) else {
            return 0;
        };
        expires
            .duration_since(SystemTime::now())
            .map_or(0, |remaining| ceil_minutes(remaining.as_secs()))
    }

    /// `Cache-Control: max-age` in minutes, rounded up. 0 when absent or invalid.
    #[must_use]
    pub fn cache_control_max_age_in_minutes(&self) -> i64 {
        self.header(CACHE_CONTROL)
            .split(',')
            .filter_map(|directive| {
                let (name, value) = directive.trim().split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("max-age")
                    .then(|| value.trim().trim_matches('"').parse::<u64>().ok())
                    .flatten()
            })
            .next()
            .map_or(0, ceil_minutes)
    }

    /// Delay requested by `Retry-After`. Never negative.
    #[must_use]
    pub fn parse_retry_delay(&self) -> Duration {
        parse_retry_delay(self.header(RETRY_AFTER))
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }

    /// Whether the resource changed relative to the stored validators.
    ///
    /// A 304 never changed. Otherwise the `ETag` decides if present, then
    /// `Last-Modified`; with neither, the content is assumed changed.
    #[must_use]
    pub fn is_modified(&self, old_etag: &str, old_last_modified: &str) -> bool {
        if self.status == StatusCode::NOT_MODIFIED {
            return false;
        }
        let etag = self.etag();
        if !etag.is_empty() {
            return etag != old_etag;
        }
        let last_modified = self.last_modified();
        if !last_modified.is_empty() {
            return last_modified != old_last_modified;
        }
        true
    }

    /// Maps the response to the error the feed should record, if any.
    #[must_use]
    pub fn localized_error(&self) -> Option<RefreshError> {
        let status = self.status.as_u16();
        if self.is_rate_limited() {
            return Some(RefreshError::rate_limited(self.parse_retry_delay().as_secs()));
        }
        if status >= 400 {
            return Some(RefreshError::http_status(status));
        }
        if self.status != StatusCode::NOT_MODIFIED && self.header(CONTENT_LENGTH) == "0" {
            return Some(RefreshError::empty_body());
        }
        None
    }

    /// Reads the whole body, failing once it exceeds `max_bytes`.
    ///
    /// # Errors
    ///
    /// Returns `BodyTooLarge` when the declared or actual size exceeds the
    /// cap, and `Transport` when the connection fails mid-body.
    #[instrument(skip(self), fields(url = %self.effective_url))]
    pub async fn read_body(&mut self, max_bytes: u64) -> Result<Vec<u8>, RefreshError> {
        let Some(response) = self
            .semaphore
            .as_mut()
            .and_then(ResponseSemaphore::take_response)
        else {
            return Ok(Vec::new());
        };

        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(RefreshError::body_too_large(max_bytes));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(RefreshError::body_read)?;
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(RefreshError::body_too_large(max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        debug!(bytes = body.len(), "read response body");
        Ok(body)
    }

    /// Drains and closes the response, releasing its host slot. Idempotent.
    pub async fn close(&mut self) {
        if let Some(semaphore) = self.semaphore.as_mut() {
            semaphore.close().await;
        }
    }
}

fn ceil_minutes(seconds: u64) -> i64 {
    i64::try_from(seconds.div_ceil(60)).unwrap_or(i64::MAX)
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Negative numbers, past dates and garbage all yield zero.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use refresher_core::fetch::parse_retry_delay;
///
/// assert_eq!(parse_retry_delay("42"), Duration::from_secs(42));
/// assert_eq!(parse_retry_delay("-5"), Duration::ZERO);
/// assert_eq!(parse_retry_delay("foobar"), Duration::ZERO);
/// ```
#[must_use]
pub fn parse_retry_delay(value: &str) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }
    if let Ok(seconds) = value.parse::<i64>() {
        return Duration::from_secs(u64::try_from(seconds).unwrap_or(0));
    }
    match httpdate::parse_http_date(value) {
        Ok(at) => at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
        Err(_) => {
            debug!(value, "unparsable Retry-After header");
            Duration::ZERO
        }
    }
}

//! Refresh error taxonomy.
//!
//! Every failure of a refresh attempt is a [`RefreshError`]: a kind used for
//! control flow, a catalog message key with its arguments used for the text
//! stored on the feed, and an optional underlying cause.

use std::fmt;

use crate::locale::{self, keys};
use crate::storage::StoreError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Sub-kinds of feed parsing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The document is not RSS, Atom or JSON Feed.
    FormatNotDetected,
    /// The format was recognized but the document is malformed.
    Invalid,
}

/// What went wrong during a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    DuplicateFeed,
    /// DNS, TLS, timeout or connection failure.
    Transport,
    /// Non-success HTTP status other than 429.
    HttpStatus,
    /// HTTP 429.
    RateLimited,
    BodyTooLarge,
    EmptyBody,
    Parse(ParseErrorKind),
    Processing,
    Persistence,
    Cancelled,
}

/// A localized, non-fatal refresh failure.
#[derive(Debug)]
pub struct RefreshError {
    kind: ErrorKind,
    key: &'static str,
    args: Vec<String>,
    source: Option<BoxError>,
}

impl RefreshError {
    fn new(kind: ErrorKind, key: &'static str, args: Vec<String>) -> Self {
        Self {
            kind,
            key,
            args,
            source: None,
        }
    }

    fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Creates a feed-not-found error.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, keys::FEED_NOT_FOUND, Vec::new())
    }

    /// Creates a duplicate-feed error for the colliding URL.
    #[must_use]
    pub fn duplicate_feed(url: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateFeed, keys::DUPLICATED_FEED, vec![url.into()])
    }

    /// Classifies a reqwest failure into a transport error.
    #[must_use]
    pub fn transport(source: reqwest::Error) -> Self {
        let detail = error_chain(&source);
        let key = if source.is_timeout() {
            keys::NETWORK_TIMEOUT
        } else if looks_like_tls(&detail) {
            keys::TLS_ERROR
        } else if source.is_connect() || source.is_request() {
            keys::NETWORK_OPERATION
        } else {
            keys::HTTP_CLIENT_ERROR
        };
        Self::new(ErrorKind::Transport, key, vec![detail]).with_source(source)
    }

    /// Creates a transport error for a request that could not be built
    /// (invalid proxy URL, client construction failure).
    #[must_use]
    pub fn client(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, keys::HTTP_CLIENT_ERROR, vec![detail.into()])
    }

    /// Maps a non-success HTTP status to its dedicated message.
    #[must_use]
    pub fn http_status(status: u16) -> Self {
        let key = match status {
            401 => keys::HTTP_NOT_AUTHORIZED,
            403 => keys::HTTP_FORBIDDEN,
            404 | 410 => keys::HTTP_RESOURCE_NOT_FOUND,
            429 => return Self::rate_limited(0),
            500 => keys::HTTP_INTERNAL_SERVER_ERROR,
            502 => keys::HTTP_BAD_GATEWAY,
            503 => keys::HTTP_SERVICE_UNAVAILABLE,
            504 => keys::HTTP_GATEWAY_TIMEOUT,
            _ => keys::HTTP_UNEXPECTED_STATUS_CODE,
        };
        Self::new(ErrorKind::HttpStatus, key, vec![status.to_string()])
    }

    /// Creates a 429 error carrying the server-advertised delay.
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            keys::HTTP_TOO_MANY_REQUESTS,
            vec![retry_after_secs.to_string()],
        )
    }

    #[must_use]
    pub fn body_too_large(max_bytes: u64) -> Self {
        Self::new(
            ErrorKind::BodyTooLarge,
            keys::HTTP_RESPONSE_TOO_LARGE,
            vec![max_bytes.to_string()],
        )
    }

    #[must_use]
    pub fn empty_body() -> Self {
        Self::new(ErrorKind::EmptyBody, keys::HTTP_EMPTY_RESPONSE_BODY, Vec::new())
    }

    /// Creates a body read failure (connection dropped mid-body).
    #[must_use]
    pub fn body_read(source: reqwest::Error) -> Self {
        let detail = error_chain(&source);
        let key = if source.is_timeout() {
            keys::NETWORK_TIMEOUT
        } else {
            keys::HTTP_BODY_READ
        };
        Self::new(ErrorKind::Transport, key, vec![detail]).with_source(source)
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(kind: ParseErrorKind, detail: impl Into<String>) -> Self {
        let key = match kind {
            ParseErrorKind::FormatNotDetected => keys::FEED_FORMAT_NOT_DETECTED,
            ParseErrorKind::Invalid => keys::UNABLE_TO_PARSE_FEED,
        };
        Self::new(ErrorKind::Parse(kind), key, vec![detail.into()])
    }

    /// Creates an entry-processing error.
    #[must_use]
    pub fn processing(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, keys::ENTRY_PROCESSING, vec![detail.into()])
    }

    /// Wraps a storage failure.
    #[must_use]
    pub fn persistence(source: StoreError) -> Self {
        Self::new(
            ErrorKind::Persistence,
            keys::DATABASE_ERROR,
            vec![source.to_string()],
        )
        .with_source(source)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, keys::REQUEST_CANCELLED, Vec::new())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Catalog key of the message.
    #[must_use]
    pub fn key(&self) -> &'static str {
        self.key
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Renders the message in `language`.
    #[must_use]
    pub fn translate(&self, language: &str) -> String {
        locale::translate(language, self.key, &self.args)
    }

    /// Whether this error increments the feed's error counter.
    #[must_use]
    pub fn counts_as_feed_error(&self) -> bool {
        !matches!(self.kind, ErrorKind::NotFound | ErrorKind::Cancelled)
    }
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.translate(locale::DEFAULT_LANGUAGE))
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Joins an error and its causes with `": "`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = cause.source();
    }
    out
}

fn looks_like_tls(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RefreshError::http_status(401).key(), keys::HTTP_NOT_AUTHORIZED);
        assert_eq!(RefreshError::http_status(403).key(), keys::HTTP_FORBIDDEN);
        assert_eq!(RefreshError::http_status(404).key(), keys::HTTP_RESOURCE_NOT_FOUND);
        assert_eq!(RefreshError::http_status(410).key(), keys::HTTP_RESOURCE_NOT_FOUND);
        assert_eq!(RefreshError::http_status(500).key(), keys::HTTP_INTERNAL_SERVER_ERROR);
        assert_eq!(RefreshError::http_status(502).key(), keys::HTTP_BAD_GATEWAY);
        assert_eq!(RefreshError::http_status(503).key(), keys::HTTP_SERVICE_UNAVAILABLE);
        assert_eq!(RefreshError::http_status(504).key(), keys::HTTP_GATEWAY_TIMEOUT);
        assert_eq!(RefreshError::http_status(418).key(), keys::HTTP_UNEXPECTED_STATUS_CODE);
    }

    #[test]
    fn test_429_maps_to_rate_limited() {
        let err = RefreshError::http_status(429);
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.counts_as_feed_error());
    }

    #[test]
    fn test_unexpected_status_message_includes_code() {
        let err = RefreshError::http_status(418);
        assert_eq!(err.to_string(), "Unexpected status code: 418.");
    }

    #[test]
    fn test_translate_in_user_language() {
        let err = RefreshError::body_too_large(1024);
        assert_eq!(err.translate("de_DE"), "Die Antwort ist größer als 1024 Bytes.");
    }

    #[test]
    fn test_not_found_and_cancelled_do_not_count() {
        assert!(!RefreshError::not_found().counts_as_feed_error());
        assert!(!RefreshError::cancelled().counts_as_feed_error());
        assert!(RefreshError::duplicate_feed("https://a").counts_as_feed_error());
    }

    #[test]
    fn test_parse_kinds() {
        let err = RefreshError::parse(ParseErrorKind::FormatNotDetected, "html page");
        assert_eq!(err.kind(), ErrorKind::Parse(ParseErrorKind::FormatNotDetected));
        assert_eq!(err.key(), keys::FEED_FORMAT_NOT_DETECTED);
        assert_eq!(err.args(), ["html page".to_string()]);
    }

    #[test]
    fn test_persistence_keeps_source() {
        let err = RefreshError::persistence(StoreError::backend("disk full"));
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_tls_detection() {
        assert!(looks_like_tls("invalid peer certificate: UnknownIssuer"));
        assert!(!looks_like_tls("connection refused"));
    }
}

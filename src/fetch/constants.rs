//! Constants for feed requests.

/// Accept header sent when the caller does not override it.
pub const DEFAULT_ACCEPT_HEADER: &str = "application/xml, application/atom+xml, \
    application/rss+xml, application/rdf+xml, application/feed+json, text/html, */*;q=0.9";

/// Unread body bytes drained on close so the connection can be reused.
pub const DRAIN_LIMIT_BYTES: usize = 256 * 1024;

/// Connect timeout, bounded by the overall request timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Idle connections kept per host by each client.
pub const POOL_MAX_IDLE_PER_HOST: usize = 4;

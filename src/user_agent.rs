//! User-Agent sent with feed requests.
//!
//! Feeds may override it individually; otherwise the configured value is used,
//! and the configured value defaults to [`default_user_agent`].

/// Product token identifying the engine in request headers.
const PRODUCT: &str = "refresher";

/// Default User-Agent for feed requests.
///
/// The `Mozilla/5.0 (compatible; ...)` prefix keeps servers that filter on
/// browser-like agents from rejecting feed readers outright.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("Mozilla/5.0 (compatible; {PRODUCT}/{version})")
}

/// Picks the agent for one request: the feed override when set, the
/// configured value otherwise.
#[must_use]
pub fn effective_user_agent<'a>(feed_override: &'a str, configured: &'a str) -> &'a str {
    let feed_override = feed_override.trim();
    if feed_override.is_empty() {
        configured
    } else {
        feed_override
    }
}

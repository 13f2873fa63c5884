//! The per-feed refresh state machine.
//!
//! One call to [`FeedRefresher::refresh_feed`] walks a feed through
//! fetch, validation, parsing and persistence:
//!
//! ```text
//! Init -> Fetch -> RateLimited | TransportError | NotModified(Headers)
//!                | NotModified(Content) | Refreshed -> Persist -> Done
//! ```
//!
//! Nothing is retried within one call; the retry unit is the next scheduled
//! check.

mod refresher;

pub use refresher::FeedRefresher;

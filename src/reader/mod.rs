//! Collaborators that turn a fetched body into stored entries.
//!
//! - [`FeedParser`]: document to entries ([`FeedRsParser`] by default).
//! - [`EntryProcessor`]: dedup and reading time ([`DefaultProcessor`]).
//! - [`IntegrationSink`] and [`IconUpdater`]: post-refresh hooks ([`Noop`]).

mod integrations;
mod parser;
mod processor;

pub use integrations::{IconUpdater, IntegrationSink, Noop};
pub use parser::{FeedParser, FeedRsParser, ParsedFeed};
pub use processor::{DefaultProcessor, EntryProcessor, WORDS_PER_MINUTE, reading_time};

//! Feed document parsing.

use feed_rs::parser::{self, ParseErrorKind as FeedRsErrorKind, ParseFeedError};
use tracing::debug;
use url::Url;

use crate::error::{ParseErrorKind, RefreshError};
use crate::model::Entry;

/// Feed-level data and entries extracted from one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: String,
    pub site_url: String,
    /// Server-advertised time to live, in minutes. 0 when absent.
    pub ttl_minutes: i64,
    pub icon_url: String,
    pub entries: Vec<Entry>,
}

/// Turns a response body into entries.
pub trait FeedParser: Send + Sync {
    /// Parses `body` fetched from `feed_url`.
    ///
    /// # Errors
    ///
    /// Returns a `Parse` error; `FormatNotDetected` when the document is not
    /// a feed at all.
    fn parse(&self, feed_url: &str, body: &[u8]) -> Result<ParsedFeed, RefreshError>;
}

/// RSS, Atom and JSON Feed through `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

impl FeedParser for FeedRsParser {
    fn parse(&self, feed_url: &str, body: &[u8]) -> Result<ParsedFeed, RefreshError> {
        let document = parser::parse(body).map_err(parse_error)?;
        let base = Url::parse(feed_url).ok();

        let site_url = document
            .links
            .iter()
            .find(|l| l.rel.as_deref().is_none_or(|rel| rel == "alternate"))
            .map(|l| resolve(base.as_ref(), &l.href))
            .unwrap_or_default();
        let icon_url = document
            .icon
            .as_ref()
            .or(document.logo.as_ref())
            .map(|image| resolve(base.as_ref(), &image.uri))
            .unwrap_or_default();

        let entries: Vec<Entry> = document
            .entries
            .into_iter()
            .map(|item| {
                let url = item
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref().is_none_or(|rel| rel == "alternate"))
                    .or(item.links.first())
                    .map(|l| resolve(base.as_ref(), &l.href))
                    .unwrap_or_default();
                let title = item.title.map(|t| t.content).unwrap_or_default();
                let content = item
                    .content
                    .and_then(|c| c.body)
                    .or_else(|| item.summary.map(|s| s.content))
                    .unwrap_or_default();
                let author = item
                    .authors
                    .into_iter()
                    .map(|p| p.name)
                    .filter(|n| !n.trim().is_empty())
                    .collect::<Vec<_>>()
                    .join(", ");
                let hash = Entry::compute_hash(&item.id, &url, &title, &content);
                Entry {
                    hash,
                    title: title.trim().to_string(),
                    url,
                    author,
                    content,
                    published_at: item.published.or(item.updated),
                    ..Entry::default()
                }
            })
            .collect();

        debug!(feed_url, entries = entries.len(), "parsed feed document");
        Ok(ParsedFeed {
            title: document.title.map(|t| t.content).unwrap_or_default(),
            site_url,
            ttl_minutes: document.ttl.map_or(0, i64::from),
            icon_url,
            entries,
        })
    }
}

fn parse_error(err: ParseFeedError) -> RefreshError {
    match err {
        ParseFeedError::ParseError(FeedRsErrorKind::NoFeedRoot | FeedRsErrorKind::UnknownMimeType(_)) => {
            RefreshError::parse(ParseErrorKind::FormatNotDetected, err.to_string())
        }
        other => RefreshError::parse(ParseErrorKind::Invalid, other.to_string()),
    }
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    let href = href.trim();
    base.and_then(|b| b.join(href).ok())
        .map_or_else(|| href.to_string(), |u| u.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example</title>
    <link>https://example.com/</link>
    <ttl>90</ttl>
    <item>
      <guid>urn:1</guid>
      <title> First </title>
      <link>/posts/1</link>
      <description>Hello world</description>
      <pubDate>Mon, 06 Sep 2021 16:45:00 GMT</pubDate>
    </item>
    <item>
      <title>Second</title>
      <link>https://example.com/posts/2</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_rss() {
        let parsed = FeedRsParser
            .parse("https://example.com/feed.xml", RSS.as_bytes())
            .unwrap();
        assert_eq!(parsed.title, "Example");
        assert_eq!(parsed.ttl_minutes, 90);
        assert_eq!(parsed.entries.len(), 2);

        let first = &parsed.entries[0];
        assert_eq!(first.title, "First");
        assert_eq!(first.url, "https://example.com/posts/1");
        assert_eq!(first.content, "Hello world");
        assert!(first.published_at.is_some());
        assert_eq!(first.hash, Entry::compute_hash("urn:1", "", "", ""));
    }

    #[test]
    fn test_html_is_format_not_detected() {
        let err = FeedRsParser
            .parse("https://example.com/", b"<html><body>nope</body></html>")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse(ParseErrorKind::FormatNotDetected));
    }

    #[test]
    fn test_json_feed() {
        let body = r#"{
            "version": "https://jsonfeed.org/version/1.1",
            "title": "JSON",
            "items": [{"id": "1", "url": "https://example.com/1", "content_text": "hi"}]
        }"#;
        let parsed = FeedRsParser
            .parse("https://example.com/feed.json", body.as_bytes())
            .unwrap();
        assert_eq!(parsed.title, "JSON");
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].url, "https://example.com/1");
    }
}

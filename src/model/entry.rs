//! Feed entries produced by the parser and consumed by storage.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Entry status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryStatus {
    #[default]
    Unread,
    Read,
    Removed,
}

impl EntryStatus {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Removed => "removed",
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(Self::Unread),
            "read" => Ok(Self::Read),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

/// A single item of a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub status: EntryStatus,
    /// Stable identity of the entry within its feed.
    pub hash: String,
    pub title: String,
    pub url: String,
    pub author: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Last status or content change, set by storage.
    pub changed_at: Option<DateTime<Utc>>,
    /// Estimated reading time in minutes.
    pub reading_time: i64,
}

impl Entry {
    /// Computes the entry hash from its identifying fields.
    ///
    /// The parser-provided id wins when present; otherwise URL, title and
    /// content are combined.
    #[must_use]
    pub fn compute_hash(guid: &str, url: &str, title: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        if guid.trim().is_empty() {
            hasher.update(url.as_bytes());
            hasher.update(b"|");
            hasher.update(title.as_bytes());
            hasher.update(b"|");
            hasher.update(content.as_bytes());
        } else {
            hasher.update(guid.trim().as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

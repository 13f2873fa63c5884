//! Outcome of one refresh attempt.

use std::time::Duration;

use super::Entry;

/// Why a refresh did not process the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotModifiedReason {
    #[default]
    None,
    /// 304, or validators equal to the stored ones.
    Headers,
    /// Body fingerprint equal to the stored one.
    Content,
}

/// Summary of a refresh attempt, used for logging only.
#[derive(Debug, Clone, Default)]
pub struct RefreshResult {
    pub refreshed: bool,
    pub not_modified: NotModifiedReason,
    pub created_entries: Vec<Entry>,
    pub updated_entries: Vec<Entry>,
    pub storage_elapsed: Duration,
}

impl RefreshResult {
    #[must_use]
    pub fn not_modified(reason: NotModifiedReason) -> Self {
        Self {
            not_modified: reason,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn created_len(&self) -> usize {
        self.created_entries.len()
    }

    #[must_use]
    pub fn updated_len(&self) -> usize {
        self.updated_entries.len()
    }
}

//! Round-robin proxy rotation.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out proxies from a fixed pool in turn.
///
/// Shared across requests; each call to [`next_proxy`](Self::next_proxy)
/// advances the rotation.
#[derive(Debug)]
pub struct ProxyRotator {
    proxies: Vec<String>,
    next: AtomicUsize,
}

impl ProxyRotator {
    /// Returns `None` when `proxies` holds no usable entry.
    #[must_use]
    pub fn new(proxies: &[String]) -> Option<Self> {
        let proxies: Vec<String> = proxies
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if proxies.is_empty() {
            return None;
        }
        Some(Self {
            proxies,
            next: AtomicUsize::new(0),
        })
    }

    /// Returns the next proxy URL.
    #[must_use]
    pub fn next_proxy(&self) -> &str {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        &self.proxies[index]
    }

    /// Number of proxies in rotation, never 0.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.proxies.len()
    }
}

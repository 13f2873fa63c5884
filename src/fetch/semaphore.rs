//! A response bundled with the host slot it occupies.

use reqwest::Response;
use tracing::debug;

use super::constants::DRAIN_LIMIT_BYTES;
use super::host_limiter::HostPermit;

/// Owns one HTTP response and the connection slot used to fetch it.
///
/// [`close`](Self::close) drains a bounded amount of unread body so the
/// connection can go back to the pool, then frees the host slot. Closing is
/// idempotent. Dropping without closing still frees the slot, but the
/// connection is discarded instead of reused.
#[derive(Debug)]
pub struct ResponseSemaphore {
    response: Option<Response>,
    permit: Option<HostPermit>,
}

impl ResponseSemaphore {
    #[must_use]
    pub fn new(response: Response, permit: HostPermit) -> Self {
        Self {
            response: Some(response),
            permit: Some(permit),
        }
    }

    /// The wrapped response, `None` once closed.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Moves the response out, keeping the host slot until `close`.
    pub(crate) fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permit.is_none()
    }

    /// Drains up to 256 KiB of remaining body, drops the response and
    /// releases the host slot. Later calls do nothing.
    pub async fn close(&mut self) {
        if let Some(mut response) = self.response.take() {
            let mut drained = 0usize;
            while drained <= DRAIN_LIMIT_BYTES {
                match response.chunk().await {
                    Ok(Some(chunk)) => drained += chunk.len(),
                    Ok(None) | Err(_) => break,
                }
            }
            if drained > 0 {
                debug!(drained, "drained unread response body");
            }
        }
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }
}

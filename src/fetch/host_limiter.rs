//! Per-host connection and request rate limiting for feed requests.
//!
//! The [`HostConcurrencyLimiter`] caps how many requests may be open against a
//! single hostname at once, independently of how many workers the pool runs,
//! and optionally spaces requests to a host at a fixed rate. Limits come from
//! [`Config::host_limits_for`], so a rule for `example.com` also covers
//! `a.example.com`.
//!
//! Rate state outlives individual requests: it is kept per hostname until
//! [`HostConcurrencyLimiter::expire_idle_hosts`] finds it unused.
//!
//! Each hostname owns a semaphore and a reference count. The entry is created
//! on the first acquisition and removed when the last holder or waiter lets
//! go. Both the count and the map mutation happen under the `DashMap` shard
//! lock, so a waiter can never hold a semaphore whose entry was removed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refresher_core::Config;
//! use refresher_core::fetch::HostConcurrencyLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(HostConcurrencyLimiter::new(Arc::new(Config::default())));
//! let cancel = CancellationToken::new();
//!
//! let permit = limiter.acquire("example.com", &cancel).await?;
//! // ... send the request
//! drop(permit); // frees the slot
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::Config;

/// Errors returned by [`HostConcurrencyLimiter::acquire`].
///
/// Reaching the limit is not an error: the caller waits.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("waiting for a connection slot to {hostname} was cancelled")]
    Cancelled { hostname: String },
}

#[derive(Debug)]
struct HostSlot {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// Holders plus waiters.
    refs: usize,
}

/// Longest spacing between two requests to one host, whatever the rate.
const MAX_RATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct HostRate {
    interval: Duration,
    /// Earliest start of the next request, `None` before the first one.
    next_slot: Mutex<Option<Instant>>,
}

impl HostRate {
    fn new(rate: f64) -> Self {
        let interval = Duration::try_from_secs_f64(rate.recip())
            .map_or(MAX_RATE_INTERVAL, |interval| interval.min(MAX_RATE_INTERVAL));
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next request slot and returns when it starts.
    async fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next = self.next_slot.lock().await;
        let slot = next.map_or(now, |next| next.max(now));
        *next = Some(slot + self.interval);
        slot
    }

    fn idle_for(&self, idle: Duration) -> bool {
        match self.next_slot.try_lock() {
            Ok(next) => next.is_none_or(|slot| slot.elapsed() >= idle),
            Err(_) => false,
        }
    }
}

/// Bounds concurrent outbound connections and request rate per hostname.
///
/// Wrap it in `Arc`: permits keep a handle on the limiter to release their
/// slot when dropped.
#[derive(Debug)]
pub struct HostConcurrencyLimiter {
    config: Arc<Config>,
    hosts: DashMap<String, HostSlot>,
    rates: DashMap<String, Arc<HostRate>>,
}

impl HostConcurrencyLimiter {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
            rates: DashMap::new(),
        }
    }

    /// Acquires a connection slot for `hostname`.
    ///
    /// A rate-limited host first waits for its next request slot. The
    /// connection slot is then tried without waiting; when the host is at
    /// capacity, the contention is logged and the call waits for a slot or
    /// for `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::Cancelled`] if `cancel` fires before the rate
    /// slot starts or a connection slot frees up.
    #[instrument(skip(self, cancel))]
    pub async fn acquire(
        self: &Arc<Self>,
        hostname: &str,
        cancel: &CancellationToken,
    ) -> Result<HostPermit, LimiterError> {
        let hostname = hostname.to_ascii_lowercase();
        let limits = self.config.host_limits_for(&hostname);
        if limits.rate > 0.0 {
            self.wait_rate(&hostname, limits.rate, cancel).await?;
        }

        let limit = limits.connections;
        if limit == 0 {
            return Ok(HostPermit {
                limiter: Arc::clone(self),
                hostname,
                permit: None,
            });
        }

        // Counted before waiting so the entry survives until we are done.
        // The shard guard is dropped at the end of this block, before any await.
        let semaphore = {
            let mut slot = self
                .hosts
                .entry(hostname.clone())
                .or_insert_with(|| HostSlot {
                    semaphore: Arc::new(Semaphore::new(limit)),
                    capacity: limit,
                    refs: 0,
                });
            slot.refs += 1;
            Arc::clone(&slot.semaphore)
        };

        // Released on every early exit, including the future being dropped.
        let mut pending = PendingRef {
            limiter: self,
            hostname: &hostname,
            armed: true,
        };

        let permit = match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                info!(hostname = %hostname, limit, "max connections limit reached, waiting for a free slot");
                let acquired = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(permit) = acquired else {
                    drop(pending);
                    return Err(LimiterError::Cancelled { hostname });
                };
                permit
            }
            Err(TryAcquireError::Closed) => {
                drop(pending);
                return Err(LimiterError::Cancelled { hostname });
            }
        };
        pending.armed = false;
        drop(pending);

        debug!(hostname = %hostname, "connection slot acquired");
        Ok(HostPermit {
            limiter: Arc::clone(self),
            hostname,
            permit: Some(permit),
        })
    }

    async fn wait_rate(
        &self,
        hostname: &str,
        rate: f64,
        cancel: &CancellationToken,
    ) -> Result<(), LimiterError> {
        // Cloned out so the shard lock is not held across the await.
        let state = self
            .rates
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(HostRate::new(rate)))
            .clone();

        let slot = state.reserve().await;
        let delay = slot.saturating_duration_since(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }

        info!(
            hostname,
            rate,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "max rate limit reached, waiting"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LimiterError::Cancelled {
                hostname: hostname.to_string(),
            }),
            () = tokio::time::sleep_until(slot) => Ok(()),
        }
    }

    /// Forgets the request rate state of hosts not requested for `idle`.
    ///
    /// Returns how many hosts were dropped.
    pub fn expire_idle_hosts(&self, idle: Duration) -> usize {
        let before = self.rates.len();
        self.rates.retain(|_, state| !state.idle_for(idle));
        let expired = before.saturating_sub(self.rates.len());
        if expired > 0 {
            debug!(expired, "idle host rate limits expired");
        }
        expired
    }

    /// Number of hostnames with request rate state.
    #[must_use]
    pub fn rate_limited_hosts(&self) -> usize {
        self.rates.len()
    }

    /// Drops one reference and removes the entry when none remain.
    fn release_ref(&self, hostname: &str) {
        let removed = self.hosts.remove_if_mut(hostname, |_, slot| {
            slot.refs = slot.refs.saturating_sub(1);
            slot.refs == 0
        });
        if removed.is_some() {
            debug!(hostname, "host entry removed");
        }
    }

    /// Number of hostnames with at least one holder or waiter.
    #[must_use]
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Holders plus waiters for `hostname`, `None` when untracked.
    #[must_use]
    pub fn refs(&self, hostname: &str) -> Option<usize> {
        self.hosts.get(hostname).map(|slot| slot.refs)
    }

    /// Slots currently in use for `hostname`.
    #[must_use]
    pub fn in_use(&self, hostname: &str) -> usize {
        self.hosts.get(hostname).map_or(0, |slot| {
            slot.capacity
                .saturating_sub(slot.semaphore.available_permits())
        })
    }
}

struct PendingRef<'a> {
    limiter: &'a HostConcurrencyLimiter,
    hostname: &'a str,
    armed: bool,
}

impl Drop for PendingRef<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.release_ref(self.hostname);
        }
    }
}

/// A held connection slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct HostPermit {
    limiter: Arc<HostConcurrencyLimiter>,
    hostname: String,
    /// `None` for unlimited hosts.
    permit: Option<OwnedSemaphorePermit>,
}

impl HostPermit {
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Releases the slot now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        // Return the slot before the entry can be removed, otherwise a new
        // entry with full capacity could appear while this one is still held.
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.limiter.release_ref(&self.hostname);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HostLimitRule;

    fn limiter(default: usize, rules: &[(&str, usize)]) -> Arc<HostConcurrencyLimiter> {
        let config = Config {
            host_connections: default,
            host_limits: rules
                .iter()
                .map(|(host, connections)| HostLimitRule {
                    host: (*host).to_string(),
                    connections: Some(*connections),
                    rate: None,
                })
                .collect(),
            ..Config::default()
        };
        Arc::new(HostConcurrencyLimiter::new(Arc::new(config)))
    }

    #[tokio::test]
    async fn test_acquire_creates_and_release_removes_entry() {
        let limiter = limiter(2, &[]);
        let cancel = CancellationToken::new();

        let permit = limiter.acquire("example.com", &cancel).await.unwrap();
        assert_eq!(limiter.refs("example.com"), Some(1));
        assert_eq!(limiter.in_use("example.com"), 1);

        permit.release();
        assert_eq!(limiter.refs("example.com"), None);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_hostname_is_case_insensitive() {
        let limiter = limiter(2, &[]);
        let cancel = CancellationToken::new();

        let _a = limiter.acquire("Example.COM", &cancel).await.unwrap();
        let _b = limiter.acquire("example.com", &cancel).await.unwrap();
        assert_eq!(limiter.refs("example.com"), Some(2));
    }

    #[tokio::test]
    async fn test_unlimited_host_is_not_tracked() {
        let limiter = limiter(0, &[]);
        let cancel = CancellationToken::new();

        let permits: Vec<_> = futures_util::future::join_all(
            (0..32).map(|_| limiter.acquire("example.com", &cancel)),
        )
        .await;
        assert!(permits.iter().all(Result::is_ok));
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let limiter = limiter(1, &[]);
        let cancel = CancellationToken::new();

        let first = limiter.acquire("example.com", &cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("example.com", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.refs("example.com"), Some(2));
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.refs("example.com"), Some(1));
        drop(second);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_its_reference() {
        let limiter = limiter(1, &[]);
        let cancel = CancellationToken::new();

        let held = limiter.acquire("example.com", &cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("example.com", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LimiterError::Cancelled { .. })));
        assert_eq!(limiter.refs("example.com"), Some(1));

        drop(held);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_suffix_rule_applies_to_subdomain() {
        let limiter = limiter(4, &[("example.com", 1)]);
        let cancel = CancellationToken::new();

        let _held = limiter.acquire("feeds.example.com", &cancel).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(30),
            limiter.acquire("feeds.example.com", &cancel),
        )
        .await;
        assert!(blocked.is_err(), "second acquisition should wait");

        // Other hosts are unaffected.
        let _other = limiter.acquire("other.org", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_leak_reference() {
        let limiter = limiter(1, &[]);
        let cancel = CancellationToken::new();

        let held = limiter.acquire("example.com", &cancel).await.unwrap();
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            limiter.acquire("example.com", &cancel),
        )
        .await;

        drop(held);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    fn rate_limiter(rate: f64, rules: Vec<HostLimitRule>) -> Arc<HostConcurrencyLimiter> {
        Arc::new(HostConcurrencyLimiter::new(Arc::new(Config {
            host_connections: 0,
            host_rate: rate,
            host_limits: rules,
            ..Config::default()
        })))
    }

    #[tokio::test]
    async fn test_rate_spaces_requests_to_one_host() {
        // 20 requests per second: one every 50ms.
        let limiter = rate_limiter(20.0, Vec::new());
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire("example.com", &cancel).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(95));

        // Another host has its own schedule.
        let started = std::time::Instant::now();
        limiter.acquire("other.org", &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(40));
        assert_eq!(limiter.rate_limited_hosts(), 2);
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_rate_rule_overrides_default() {
        let limiter = rate_limiter(
            0.0,
            vec![HostLimitRule {
                host: "slow.example.com".to_string(),
                connections: None,
                rate: Some(0.1),
            }],
        );
        let cancel = CancellationToken::new();

        limiter.acquire("feeds.slow.example.com", &cancel).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(30),
            limiter.acquire("feeds.slow.example.com", &cancel),
        )
        .await;
        assert!(blocked.is_err(), "second request should wait for its slot");

        // No default rate: unmatched hosts are never delayed or tracked.
        for _ in 0..5 {
            limiter.acquire("fast.org", &cancel).await.unwrap();
        }
        assert_eq!(limiter.rate_limited_hosts(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_rate() {
        let limiter = rate_limiter(0.5, Vec::new());
        let cancel = CancellationToken::new();
        limiter.acquire("example.com", &cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("example.com", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LimiterError::Cancelled { .. })));
        assert_eq!(limiter.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_expire_idle_hosts() {
        let limiter = rate_limiter(1000.0, Vec::new());
        let cancel = CancellationToken::new();
        limiter.acquire("example.com", &cancel).await.unwrap();

        assert_eq!(limiter.expire_idle_hosts(Duration::from_secs(3600)), 0);
        assert_eq!(limiter.rate_limited_hosts(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.expire_idle_hosts(Duration::from_millis(10)), 1);
        assert_eq!(limiter.rate_limited_hosts(), 0);
    }
}

//! Concurrency tests for the per-host connection limiter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use refresher_core::Config;
use refresher_core::config::HostLimitRule;
use refresher_core::fetch::HostConcurrencyLimiter;
use tokio_util::sync::CancellationToken;

fn limiter(host_connections: usize, rules: Vec<HostLimitRule>) -> Arc<HostConcurrencyLimiter> {
    Arc::new(HostConcurrencyLimiter::new(Arc::new(Config {
        host_connections,
        host_limits: rules,
        ..Config::default()
    })))
}

#[tokio::test]
async fn test_slots_never_exceed_limit() -> Result<(), Box<dyn std::error::Error>> {
    let limiter = limiter(3, Vec::new());
    let cancel = CancellationToken::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let permit = limiter.acquire("feeds.example.com", &cancel).await?;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                Ok::<_, refresher_core::fetch::LimiterError>(())
            })
        })
        .collect();

    for result in futures_util::future::join_all(tasks).await {
        result??;
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.tracked_hosts(), 0);
    Ok(())
}

#[tokio::test]
async fn test_hosts_are_limited_independently() -> Result<(), Box<dyn std::error::Error>> {
    let limiter = limiter(
        1,
        vec![HostLimitRule {
            host: "example.org".to_string(),
            connections: Some(2),
            rate: None,
        }],
    );
    let cancel = CancellationToken::new();

    let a = limiter.acquire("a.example.com", &cancel).await?;
    let b1 = limiter.acquire("cdn.example.org", &cancel).await?;
    let b2 = limiter.acquire("cdn.example.org", &cancel).await?;
    assert_eq!(limiter.tracked_hosts(), 2);
    assert_eq!(limiter.in_use("cdn.example.org"), 2);

    // a.example.com is full, the waiter times out and leaves no trace.
    let blocked = tokio::time::timeout(
        Duration::from_millis(20),
        limiter.acquire("a.example.com", &cancel),
    )
    .await;
    assert!(blocked.is_err());
    assert_eq!(limiter.refs("a.example.com"), Some(1));

    drop((a, b1, b2));
    assert_eq!(limiter.tracked_hosts(), 0);
    Ok(())
}

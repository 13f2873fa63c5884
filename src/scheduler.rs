//! Batch production and periodic cleanup.
//!
//! Two independent loops share one cancellation token:
//!
//! - the feed loop selects due feeds on every tick, or earlier when the pool
//!   signals that it ran dry, and pushes them to the [`WorkerPool`];
//! - the cleanup loop archives old read entries and removes expired sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::fetch::HostConcurrencyLimiter;
use crate::model::BatchQuery;
use crate::storage::{BatchSource, CleanupStore, StoreError};
use crate::worker::{PoolError, WorkerPool};

/// Errors raised while producing a batch.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unable to select due feeds: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Counts reported by one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub archived_entries: u64,
    pub removed_sessions: u64,
}

/// Drives the worker pool and the cleanup tasks.
pub struct Scheduler {
    config: Arc<Config>,
    batches: Arc<dyn BatchSource>,
    cleanup: Arc<dyn CleanupStore>,
    pool: Arc<WorkerPool>,
    host_limiter: Option<Arc<HostConcurrencyLimiter>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        batches: Arc<dyn BatchSource>,
        cleanup: Arc<dyn CleanupStore>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            config,
            batches,
            cleanup,
            pool,
            host_limiter: None,
        }
    }

    /// Expires the limiter's idle per-host rate state after every batch.
    #[must_use]
    pub fn with_host_limiter(mut self, limiter: Arc<HostConcurrencyLimiter>) -> Self {
        self.host_limiter = Some(limiter);
        self
    }

    /// Runs both loops until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) {
        tokio::join!(self.run_feed_loop(cancel), self.run_cleanup_loop(cancel));
    }

    /// Feed loop: one batch per tick or per pool wakeup.
    #[instrument(skip_all)]
    pub async fn run_feed_loop(&self, cancel: &CancellationToken) {
        let period = minutes(self.config.polling_frequency_minutes);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "feed scheduler started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => debug!("scheduler tick"),
                () = self.pool.wakeup_signal() => debug!("worker pool wakeup"),
            }

            match self.schedule_batch(cancel).await {
                Ok(_) => {}
                Err(SchedulerError::Pool(PoolError::Cancelled { .. })) => break,
                Err(e) => warn!(error = %e, "unable to schedule feed batch"),
            }
            if let Some(limiter) = &self.host_limiter {
                limiter.expire_idle_hosts(period);
            }
        }
        info!("feed scheduler stopped");
    }

    /// Selects one batch of due feeds and pushes it to the pool.
    ///
    /// Does nothing while jobs are still in flight, except arming the pool
    /// wakeup, so a feed is never queued twice.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the due-feed query or the push fails.
    pub async fn schedule_batch(&self, cancel: &CancellationToken) -> Result<usize, SchedulerError> {
        let in_flight = self.pool.in_flight();
        if in_flight > 0 {
            debug!(in_flight, "worker pool busy, skipping batch");
            self.pool.with_wakeup();
            return Ok(0);
        }

        let query = BatchQuery::due(self.config.batch_size, self.config.polling_parsing_error_limit);
        let jobs = self.batches.due_jobs(&query).await?;
        if jobs.is_empty() {
            debug!("no feed due");
            return Ok(0);
        }

        let full = query.batch_size > 0 && jobs.len() >= query.batch_size;
        info!(jobs = jobs.len(), batch_size = query.batch_size, "pushing feed batch");
        let pushed = self.pool.push(jobs, cancel).await?;
        if full {
            self.pool.with_wakeup();
        }
        Ok(pushed)
    }

    /// Cleanup loop: first run one period after start.
    #[instrument(skip_all)]
    pub async fn run_cleanup_loop(&self, cancel: &CancellationToken) {
        let period = Duration::from_secs(self.config.cleanup_frequency_hours.saturating_mul(3600));
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "cleanup scheduler started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cleanup().await;
                }
            }
        }
        info!("cleanup scheduler stopped");
    }

    /// Archives old read entries and deletes expired sessions.
    ///
    /// Failures are logged; the other task still runs.
    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if self.config.cleanup_archive_read_days > 0 {
            let started = Instant::now();
            match self
                .cleanup
                .archive_read_entries(
                    self.config.cleanup_archive_read_days,
                    self.config.cleanup_archive_batch_size,
                )
                .await
            {
                Ok(count) => {
                    report.archived_entries = count;
                    info!(
                        count,
                        elapsed_ms = elapsed_ms(started),
                        "archived read entries"
                    );
                }
                Err(e) => warn!(error = %e, "unable to archive read entries"),
            }
        }

        let started = Instant::now();
        match self
            .cleanup
            .delete_expired_sessions(self.config.cleanup_remove_sessions_days)
            .await
        {
            Ok(count) => {
                report.removed_sessions = count;
                info!(
                    count,
                    elapsed_ms = elapsed_ms(started),
                    "removed expired sessions"
                );
            }
            Err(e) => warn!(error = %e, "unable to remove expired sessions"),
        }
        report
    }
}

fn minutes(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(1).max(1).saturating_mul(60))
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

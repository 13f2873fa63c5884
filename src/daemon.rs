//! Wiring and supervision of the long-running engine.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::fetch::{HostConcurrencyLimiter, RequestBuilder};
use crate::refresh::FeedRefresher;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{BatchSource, CleanupStore, FeedStore};
use crate::worker::{PoolError, WorkerPool};

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A supervised task panicked or was aborted.
    #[error("engine task failed: {0}")]
    Task(String),
}

/// Refresher, worker pool and scheduler built from one configuration.
#[derive(Debug)]
pub struct Daemon {
    refresher: Arc<FeedRefresher>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
}

impl Daemon {
    /// Builds every component around `store`.
    #[must_use]
    pub fn new<S>(config: Arc<Config>, store: Arc<S>) -> Self
    where
        S: FeedStore + BatchSource + CleanupStore + 'static,
    {
        let limiter = Arc::new(HostConcurrencyLimiter::new(Arc::clone(&config)));
        let requests = Arc::new(RequestBuilder::new(
            Arc::clone(&config),
            Arc::clone(&limiter),
        ));
        let refresher = Arc::new(FeedRefresher::new(
            Arc::clone(&config),
            store.clone(),
            requests,
        ));
        let pool = Arc::new(WorkerPool::from_config(&config, refresher.clone()));
        let scheduler = Arc::new(
            Scheduler::new(config, store.clone(), store, Arc::clone(&pool))
                .with_host_limiter(limiter),
        );
        Self {
            refresher,
            pool,
            scheduler,
        }
    }

    #[must_use]
    pub fn refresher(&self) -> &Arc<FeedRefresher> {
        &self.refresher
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Runs the pool and both scheduler loops until `cancel` fires.
    ///
    /// The first fatal failure cancels every other task.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`DaemonError`].
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let mut tasks: JoinSet<Result<(), DaemonError>> = JoinSet::new();
        {
            let pool = Arc::clone(&self.pool);
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.run(cancel).await.map_err(DaemonError::from) });
        }
        {
            let scheduler = Arc::clone(&self.scheduler);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                scheduler.run(&cancel).await;
                Ok(())
            });
        }
        info!("engine started");

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(DaemonError::Task(e.to_string())));
            if let Err(e) = result {
                warn!(error = %e, "engine task failed, shutting down");
                cancel.cancel();
                failure.get_or_insert(e);
            }
        }
        info!("engine stopped");
        failure.map_or(Ok(()), Err)
    }

    /// Refreshes one batch of due feeds and waits for it to finish.
    ///
    /// Returns how many jobs were pushed.
    ///
    /// # Errors
    ///
    /// Returns a [`DaemonError`] when selecting or pushing the batch fails.
    #[instrument(skip_all)]
    pub async fn refresh_batch(&self, cancel: &CancellationToken) -> Result<usize, DaemonError> {
        let workers = cancel.child_token();
        let runner = {
            let pool = Arc::clone(&self.pool);
            let workers = workers.clone();
            tokio::spawn(async move { pool.run(workers).await })
        };

        let pushed = self.scheduler.schedule_batch(cancel).await;
        if pushed.is_ok() {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = self.pool.wait_idle() => {}
            }
        }
        workers.cancel();
        runner
            .await
            .map_err(|e| DaemonError::Task(e.to_string()))??;

        let pushed = pushed?;
        info!(
            pushed,
            processed = self.pool.processed(),
            failed = self.pool.failed(),
            "batch finished"
        );
        Ok(pushed)
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("interrupt received"),
        () = terminate => info!("terminate signal received"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Feed, User};
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_refresh_batch_processes_due_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<rss version="2.0"><channel><title>T</title><item><guid>1</guid></item></channel></rss>"#,
            ))
            .expect(3)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_user(User::new(1, "alice", "en_US"));
        for n in 0..3 {
            store.insert_feed(Feed {
                user_id: 1,
                feed_url: format!("{}/feed/{n}", server.uri()),
                ..Feed::default()
            });
        }

        let daemon = Daemon::new(Arc::new(Config::default()), Arc::clone(&store));
        let pushed = daemon
            .refresh_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pushed, 3);
        assert_eq!(daemon.pool().processed(), 3);
        assert_eq!(daemon.pool().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let daemon = Daemon::new(Arc::new(Config::default()), store);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), daemon.run(cancel))
            .await
            .unwrap()
            .unwrap();
    }
}

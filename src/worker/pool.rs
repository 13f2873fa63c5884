//! Fixed-size pool of refresh workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{ErrorKind, RefreshError};
use crate::model::{Job, RefreshResult};

/// Work performed for each job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one job. Errors are logged by the pool and never stop it.
    async fn handle(&self, job: &Job, cancel: &CancellationToken)
    -> Result<RefreshResult, RefreshError>;
}

/// Errors raised by the pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue has no receiver anymore.
    #[error("worker queue is closed")]
    Closed,

    /// Cancellation fired while waiting for queue space.
    #[error("push cancelled after {pushed} jobs")]
    Cancelled { pushed: usize },

    /// A worker task panicked.
    #[error("worker task failed: {0}")]
    Worker(String),
}

struct Shared {
    handler: Arc<dyn JobHandler>,
    receiver: Mutex<mpsc::Receiver<Job>>,
    /// Jobs pushed and not yet finished.
    in_flight: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    wakeup: Notify,
    wakeup_armed: AtomicBool,
    idle: Notify,
}

impl Shared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
            if self.wakeup_armed.swap(false, Ordering::AcqRel) {
                debug!("worker pool drained, waking scheduler");
                self.wakeup.notify_one();
            }
        }
    }
}

/// Bounded-concurrency executor for refresh jobs.
///
/// `size` workers share one bounded queue. [`push`](Self::push) blocks while
/// the queue is full; [`run`](Self::run) keeps the workers alive until the
/// token is cancelled.
pub struct WorkerPool {
    size: usize,
    sender: mpsc::Sender<Job>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool of `size` workers (at least one). The queue holds
    /// `size` jobs.
    #[must_use]
    pub fn new(size: usize, handler: Arc<dyn JobHandler>) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size);
        Self {
            size,
            sender,
            shared: Arc::new(Shared {
                handler,
                receiver: Mutex::new(receiver),
                in_flight: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                wakeup: Notify::new(),
                wakeup_armed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, handler: Arc<dyn JobHandler>) -> Self {
        Self::new(config.worker_pool_size, handler)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Jobs finished successfully since creation.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Jobs finished with an error since creation.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Runs the workers until `cancel` fires and every started job returned.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Worker`] if a worker task panicked.
    #[instrument(skip_all, fields(size = self.size))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PoolError> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.size {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            workers.spawn(async move { worker_loop(worker_id, &shared, &cancel).await });
        }
        info!(workers = self.size, "worker pool started");

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task panicked");
                failure.get_or_insert_with(|| PoolError::Worker(e.to_string()));
            }
        }
        info!(
            processed = self.processed(),
            failed = self.failed(),
            "worker pool stopped"
        );
        failure.map_or(Ok(()), Err)
    }

    /// Enqueues `jobs`, interleaving hosts. Returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Cancelled`] when `cancel` fires while the queue
    /// is full, and [`PoolError::Closed`] when the queue is gone.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn push(&self, jobs: Vec<Job>, cancel: &CancellationToken) -> Result<usize, PoolError> {
        let jobs = distribute_jobs(jobs);
        let mut pushed = 0;
        for job in jobs {
            self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(PoolError::Cancelled { pushed }),
                sent = self.sender.send(job) => sent.map_err(|_| PoolError::Closed),
            };
            if let Err(e) = sent {
                self.shared.finish_one();
                return Err(e);
            }
            pushed += 1;
        }
        debug!(pushed, "jobs queued");
        Ok(pushed)
    }

    /// Arms one wakeup for the next time the pool runs out of work.
    pub fn with_wakeup(&self) {
        self.shared.wakeup_armed.store(true, Ordering::Release);
        if self.in_flight() == 0 && self.shared.wakeup_armed.swap(false, Ordering::AcqRel) {
            self.shared.wakeup.notify_one();
        }
    }

    /// Resolves once an armed wakeup fires. At most one signal is pending.
    pub async fn wakeup_signal(&self) {
        self.shared.wakeup.notified().await;
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn worker_loop(worker_id: usize, shared: &Shared, cancel: &CancellationToken) {
    debug!(worker_id, "worker started");
    loop {
        let job = {
            let mut receiver = shared.receiver.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        // Each job runs in its own task so a panic is reported as a failed
        // job and the in-flight count still drops.
        let handler = Arc::clone(&shared.handler);
        let task_job = job.clone();
        let task_cancel = cancel.clone();
        let outcome =
            tokio::spawn(async move { handler.handle(&task_job, &task_cancel).await }).await;

        match outcome {
            Ok(Ok(_)) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                match e.kind() {
                    ErrorKind::Cancelled => {
                        debug!(worker_id, feed_id = job.feed_id, "job cancelled");
                    }
                    _ => warn!(
                        worker_id,
                        user_id = job.user_id,
                        feed_id = job.feed_id,
                        error = %e,
                        "job failed"
                    ),
                }
            }
            Err(join_error) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker_id,
                    user_id = job.user_id,
                    feed_id = job.feed_id,
                    error = %join_error,
                    "job panicked"
                );
            }
        }
        shared.finish_one();
    }
    debug!(worker_id, "worker stopped");
}

/// Orders `jobs` so consecutive jobs target different hosts where possible.
///
/// Hosts with the most jobs come first; within a host the original order is
/// kept.
#[must_use]
pub fn distribute_jobs(jobs: Vec<Job>) -> Vec<Job> {
    let total = jobs.len();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<VecDeque<Job>> = Vec::new();
    for job in jobs {
        let slot = *index.entry(job.host_key()).or_insert_with(|| {
            groups.push(VecDeque::new());
            groups.len() - 1
        });
        groups[slot].push_back(job);
    }
    groups.sort_by(|a, b| b.len().cmp(&a.len()));

    let mut ordered = Vec::with_capacity(total);
    while ordered.len() < total {
        for group in &mut groups {
            if let Some(job) = group.pop_front() {
                ordered.push(job);
            }
        }
    }
    ordered
}

//! Job execution.
//!
//! The [`WorkerPool`] runs a fixed number of workers over a bounded queue.
//! Each job goes to a [`JobHandler`]; in the daemon that is the feed
//! refresher.

mod pool;

pub use pool::{JobHandler, PoolError, WorkerPool, distribute_jobs};

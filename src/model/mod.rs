//! Data types shared by the scheduler, the worker pool and the refresher.

mod entry;
mod feed;
mod job;
mod refreshed;
mod user;

pub use entry::{Entry, EntryStatus};
pub use feed::{ContentFingerprint, Feed};
pub use job::{BatchQuery, Job};
pub use refreshed::{NotModifiedReason, RefreshResult};
pub use user::User;

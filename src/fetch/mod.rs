//! HTTP primitives for fetching feeds.
//!
//! - [`HostConcurrencyLimiter`] caps concurrent connections per hostname.
//! - [`RequestBuilder`] sends one conditional GET per call under that cap.
//! - [`ResponseHandler`] interprets caching headers, rate limiting and
//!   modification state, and reads the body under a size cap.
//! - [`ResponseSemaphore`] ties a response to its host slot so the slot is
//!   released exactly once.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use refresher_core::Config;
//! use refresher_core::fetch::{HostConcurrencyLimiter, RequestBuilder, RequestOptions, ResponseHandler};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::default());
//! let limiter = Arc::new(HostConcurrencyLimiter::new(Arc::clone(&config)));
//! let builder = RequestBuilder::new(config, limiter);
//!
//! let options = RequestOptions::default().with_validators("\"abc\"", "");
//! let semaphore = builder
//!     .execute("https://example.com/feed.xml", &options, &CancellationToken::new())
//!     .await?;
//! let mut response = ResponseHandler::new(semaphore);
//! if response.is_modified("\"abc\"", "") {
//!     let body = response.read_body(1024 * 1024).await?;
//!     println!("{} bytes", body.len());
//! }
//! response.close().await;
//! # Ok(())
//! # }
//! ```

mod constants;
pub mod host_limiter;
mod proxy;
mod request;
mod response;
mod semaphore;

pub use constants::{DEFAULT_ACCEPT_HEADER, DRAIN_LIMIT_BYTES};
pub use host_limiter::{HostConcurrencyLimiter, HostPermit, LimiterError};
pub use proxy::ProxyRotator;
pub use request::{RequestBuilder, RequestOptions};
pub use response::{ResponseHandler, parse_retry_delay};
pub use semaphore::ResponseSemaphore;

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, RefreshError>` explicitly in function signatures.

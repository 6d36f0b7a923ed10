#![forbid(unsafe_code)]

//! Network boundary of the weft streaming core.
//!
//! The core consumes a single abstraction, [`Fetcher`]: get the bytes of a
//! URL, optionally a byte range of it. Everything else here is layering on
//! top of that seam: a reqwest-backed [`HttpFetcher`], and a
//! [`RetryFetcher`] decorator applying exponential backoff with full jitter
//! to retryable failures.
//!
//! Cancellation is cooperative: callers race a fetch future against their
//! cancellation token and map cancellation to [`NetError::Aborted`].

mod client;
mod error;
mod retry;
mod traits;
mod types;

pub use client::HttpFetcher;
pub use error::{NetError, NetResult};
pub use retry::RetryFetcher;
pub use traits::{Fetcher, FetcherExt};
pub use types::{Headers, NetOptions, RangeSpec, RetryPolicy};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::{error::NetError, types::RangeSpec};

/// The fetch seam the streaming core consumes.
///
/// Implementations complete with [`NetError::Aborted`] when cancelled and
/// [`NetError::HttpStatus`] on HTTP failure.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the bytes of a URL, optionally restricted to a byte range.
    async fn fetch(&self, url: Url, range: Option<RangeSpec>) -> Result<Bytes, NetError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    async fn fetch(&self, url: Url, range: Option<RangeSpec>) -> Result<Bytes, NetError> {
        (**self).fetch(url, range).await
    }
}

pub trait FetcherExt: Fetcher + Sized {
    /// Add a retry layer.
    fn with_retry(self, policy: crate::types::RetryPolicy) -> crate::retry::RetryFetcher<Self> {
        crate::retry::RetryFetcher::new(self, policy)
    }
}

impl<T: Fetcher> FetcherExt for T {}

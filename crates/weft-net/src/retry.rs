use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use url::Url;

use crate::{
    error::NetError,
    traits::Fetcher,
    types::{RangeSpec, RetryPolicy},
};

/// Retry decorator for [`Fetcher`] implementations.
///
/// Retries only errors classified retryable by [`NetError::is_retryable`];
/// an `Aborted` result is returned to the caller untouched.
pub struct RetryFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: Fetcher> RetryFetcher<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for RetryFetcher<F> {
    async fn fetch(&self, url: Url, range: Option<RangeSpec>) -> Result<Bytes, NetError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch(url.clone(), range).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.policy.max_retries {
                        if attempt > 0 {
                            return Err(NetError::RetryExhausted {
                                attempts: attempt + 1,
                                source: Box::new(error),
                            });
                        }
                        return Err(error);
                    }

                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying fetch"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

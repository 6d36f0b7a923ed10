use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;
use weft_net::{Fetcher, FetcherExt, NetError, RangeSpec, RetryPolicy};

/// Fails the first `failures` calls with the given error, then succeeds.
struct FlakyFetcher {
    failures: u32,
    error: NetError,
    calls: Arc<AtomicU32>,
}

impl FlakyFetcher {
    fn new(failures: u32, error: NetError) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                failures,
                error,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl Fetcher for FlakyFetcher {
    async fn fetch(&self, _url: Url, _range: Option<RangeSpec>) -> Result<Bytes, NetError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(Bytes::from_static(b"payload"))
        }
    }
}

fn seg_url() -> Url {
    Url::parse("http://example.com/seg_0.m4s").unwrap()
}

#[tokio::test(start_paused = true)]
async fn recovers_from_transient_failures() {
    let (flaky, calls) = FlakyFetcher::new(2, NetError::Timeout);
    let fetcher = flaky.with_retry(RetryPolicy::default());

    let bytes = fetcher.fetch(seg_url(), None).await.unwrap();
    assert_eq!(bytes.as_ref(), b"payload");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausts_after_max_retries() {
    let (flaky, calls) = FlakyFetcher::new(u32::MAX, NetError::Timeout);
    let fetcher = flaky.with_retry(RetryPolicy::default());

    let err = fetcher.fetch(seg_url(), None).await.unwrap_err();
    assert!(matches!(err, NetError::RetryExhausted { attempts: 4, .. }));
    // 1 initial + 3 retries
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_fails_fast() {
    let error = NetError::HttpStatus {
        status: 404,
        url: seg_url(),
    };
    let (flaky, calls) = FlakyFetcher::new(u32::MAX, error);
    let fetcher = flaky.with_retry(RetryPolicy::default());

    let err = fetcher.fetch(seg_url(), None).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn aborted_is_never_retried() {
    let (flaky, calls) = FlakyFetcher::new(u32::MAX, NetError::Aborted);
    let fetcher = flaky.with_retry(RetryPolicy::default());

    let err = fetcher.fetch(seg_url(), None).await.unwrap_err();
    assert!(matches!(err, NetError::Aborted));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried() {
    let error = NetError::HttpStatus {
        status: 503,
        url: seg_url(),
    };
    let (flaky, calls) = FlakyFetcher::new(1, error);
    let fetcher = flaky.with_retry(RetryPolicy::default());

    assert!(fetcher.fetch(seg_url(), None).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

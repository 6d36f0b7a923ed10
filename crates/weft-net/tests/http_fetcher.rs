use axum::{
    Router,
    http::{HeaderMap, StatusCode},
    routing::get,
};
use tokio::net::TcpListener;
use url::Url;
use weft_net::{Fetcher, HttpFetcher, NetOptions, RangeSpec};

async fn segment() -> &'static [u8] {
    b"0123456789"
}

async fn ranged(headers: HeaderMap) -> (StatusCode, String) {
    let range = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    (StatusCode::PARTIAL_CONTENT, range)
}

async fn flaky() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn run_test_server() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/seg.m4s", get(segment))
        .route("/ranged.m4s", get(ranged))
        .route("/down.m4s", get(flaky));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Url::parse(&format!("http://127.0.0.1:{}/", addr.port())).unwrap()
}

#[tokio::test]
async fn fetches_full_body() {
    let base = run_test_server().await;
    let fetcher = HttpFetcher::new(NetOptions::default());

    let bytes = fetcher
        .fetch(base.join("seg.m4s").unwrap(), None)
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), b"0123456789");
}

#[tokio::test]
async fn sends_range_header() {
    let base = run_test_server().await;
    let fetcher = HttpFetcher::new(NetOptions::default());

    let bytes = fetcher
        .fetch(
            base.join("ranged.m4s").unwrap(),
            Some(RangeSpec::new(100, Some(199))),
        )
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), b"bytes=100-199");
}

#[tokio::test]
async fn surfaces_http_status() {
    let base = run_test_server().await;
    let fetcher = HttpFetcher::new(NetOptions::default());

    let err = fetcher
        .fetch(base.join("down.m4s").unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_resource_is_not_retryable() {
    let base = run_test_server().await;
    let fetcher = HttpFetcher::new(NetOptions::default());

    let err = fetcher
        .fetch(base.join("nope.m4s").unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(!err.is_retryable());
}

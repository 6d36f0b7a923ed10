use reqwest::Error as ReqwestError;
use thiserror::Error;
use url::Url;

pub type NetResult<T> = Result<T, NetError>;

/// Centralized error type for weft-net.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Timeout")]
    Timeout,

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: Url },

    #[error("Request failed after {attempts} attempts: {source}")]
    RetryExhausted { attempts: u32, source: Box<Self> },

    /// The fetch was cancelled by its owner. Never surfaced to the user.
    #[error("Aborted")]
    Aborted,
}

impl NetError {
    /// Whether a retry has any chance of succeeding.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            Self::Http(msg) => {
                msg.contains("timeout") || msg.contains("connection") || msg.contains("body")
            }
            Self::RetryExhausted { .. } | Self::Aborted => false,
        }
    }

    /// HTTP status carried by this error, when there is one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<ReqwestError> for NetError {
    fn from(e: ReqwestError) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        // Alternate formatting includes the full error chain
        // (e.g. "error sending request … : connection refused").
        Self::Http(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/seg.m4s").unwrap()
    }

    #[rstest]
    #[case::timeout(NetError::Timeout, true)]
    #[case::http_500(NetError::HttpStatus { status: 500, url: url() }, true)]
    #[case::http_503(NetError::HttpStatus { status: 503, url: url() }, true)]
    #[case::http_429(NetError::HttpStatus { status: 429, url: url() }, true)]
    #[case::http_408(NetError::HttpStatus { status: 408, url: url() }, true)]
    #[case::http_404(NetError::HttpStatus { status: 404, url: url() }, false)]
    #[case::http_403(NetError::HttpStatus { status: 403, url: url() }, false)]
    #[case::connection(NetError::Http("connection reset".into()), true)]
    #[case::other(NetError::Http("invalid header".into()), false)]
    #[case::aborted(NetError::Aborted, false)]
    #[case::exhausted(
        NetError::RetryExhausted { attempts: 3, source: Box::new(NetError::Timeout) },
        false
    )]
    fn retryability(#[case] error: NetError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[test]
    fn status_looks_through_retry_exhausted() {
        let inner = NetError::HttpStatus {
            status: 503,
            url: url(),
        };
        let outer = NetError::RetryExhausted {
            attempts: 3,
            source: Box::new(inner),
        };
        assert_eq!(outer.status(), Some(503));
        assert_eq!(NetError::Aborted.status(), None);
    }

    #[test]
    fn display_formats() {
        let e = NetError::HttpStatus {
            status: 404,
            url: url(),
        };
        assert_eq!(e.to_string(), "HTTP 404 for http://example.com/seg.m4s");
        assert_eq!(NetError::Aborted.to_string(), "Aborted");
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    traits::Fetcher,
    types::{NetOptions, RangeSpec},
};

/// reqwest-backed [`Fetcher`].
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    inner: Client,
    options: NetOptions,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }

    async fn get(&self, url: Url, range: Option<RangeSpec>) -> NetResult<Bytes> {
        let mut req = self.inner.get(url.clone());
        for (k, v) in self.options.default_headers.iter() {
            req = req.header(k, v);
        }
        if let Some(range) = range {
            req = req.header("Range", range.to_header_value());
        }
        let req = req.timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        let partial_ok = range.is_some() && status.as_u16() == 206;
        if !(status.is_success() || partial_ok) {
            return Err(NetError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        resp.bytes().await.map_err(NetError::from)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: Url, range: Option<RangeSpec>) -> Result<Bytes, NetError> {
        self.get(url, range).await
    }
}

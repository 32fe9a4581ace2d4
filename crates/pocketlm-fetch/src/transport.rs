//! Byte transport behind the download manager.
//!
//! [`Transport`] is the seam between the resumable-transfer logic and the
//! network; [`HttpTransport`] is the production implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, header};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// An opened transfer.
pub struct TransferResponse {
    /// `true` when the server honoured the requested offset (HTTP 206).
    /// `false` means the body starts at byte zero.
    pub partial: bool,
    /// Length of `body`, not of the whole file.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("partial", &self.partial)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open `url`, asking for bytes from `offset` onward when `offset > 0`.
    async fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Explicit proxy URL; `HTTP_PROXY` / `HTTPS_PROXY` are honoured otherwise.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpTransportConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .user_agent(concat!("pocketlm-fetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout);

        if let Some(proxy_url) = &config.proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => warn!(proxy = %proxy_url, error = %e, "ignoring invalid proxy URL"),
            }
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str, offset: u64) -> Result<TransferResponse, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        let resp = request.send().await?;
        let status = resp.status();
        debug!(url, offset, status = status.as_u16(), "transfer opened");

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(FetchError::RangeNotSatisfiable { offset });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let content_length = resp.content_length();
        let body = resp.bytes_stream().map_err(FetchError::from).boxed();

        Ok(TransferResponse {
            partial,
            content_length,
            body,
        })
    }
}

//! [`Transport`] over HTTP against a Cloudflare-compatible speed server.
//!
//! `GET /__down?bytes=N` streams N bytes back, `POST /__up` swallows a body,
//! and `GET /__down?bytes=0` doubles as the ping probe. Every request
//! disables caching and carries a unique query parameter so no proxy can
//! answer from a cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use log::trace;
use reqwest::Client;
use tokio::time::Instant;
use url::Url;

use super::{TransferError, Transport};
use crate::errors::{ErrorKind, SpeedTestError};
use crate::settings::Settings;

pub const DEFAULT_SERVER: &str = "https://speed.cloudflare.com";

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

const DOWNLOAD_PATH: &str = "__down";
const UPLOAD_PATH: &str = "__up";

/// Extra allowance on top of the phase budget before a single request is
/// considered hung.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    nonce: AtomicU64,
}

impl HttpTransport {
    pub fn new(server: &Url, settings: &Settings) -> Result<Self, SpeedTestError> {
        let timeout =
            settings.max_duration + settings.grace_time + REQUEST_TIMEOUT_SLACK;

        let client = Client::builder()
            .user_agent(format!("{}/{}", NAME, VERSION))
            .default_headers(no_cache_headers())
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SpeedTestError::network(format!("cannot build HTTP client: {}", e))
                    .with_source(e)
            })?;

        Ok(Self { client, base: with_trailing_slash(server), nonce: AtomicU64::new(0) })
    }

    pub fn server(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str, bytes: Option<u64>) -> Result<Url, TransferError> {
        let mut url = self.base.join(path).map_err(|e| {
            TransferError::new(ErrorKind::Config, format!("bad endpoint {}: {}", path, e))
        })?;

        {
            let mut query = url.query_pairs_mut();
            if let Some(bytes) = bytes {
                query.append_pair("bytes", &bytes.to_string());
            }
            query.append_pair("r", &self.cache_buster());
        }

        Ok(url)
    }

    fn cache_buster(&self) -> String {
        let sequence = self.nonce.fetch_add(1, Ordering::Relaxed);
        format!("{:x}{:04x}", chrono::Utc::now().timestamp_millis(), sequence)
    }
}

impl Transport for HttpTransport {
    async fn request_chunk(&self, bytes: u64) -> Result<u64, TransferError> {
        let url = self.endpoint(DOWNLOAD_PATH, Some(bytes))?;
        trace!("GET {}", url);

        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await? {
            received += chunk.len() as u64;
        }

        Ok(received)
    }

    async fn send_chunk(&self, payload: Bytes) -> Result<(), TransferError> {
        let url = self.endpoint(UPLOAD_PATH, None)?;
        trace!("POST {} ({} bytes)", url, payload.len());

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .body(payload)
            .send()
            .await?
            .error_for_status()?;

        // The acknowledgement is only complete once its body has been read.
        response.bytes().await?;

        Ok(())
    }

    async fn probe(&self) -> Result<Duration, TransferError> {
        let url = self.endpoint(DOWNLOAD_PATH, Some(0))?;

        let start = Instant::now();
        let response = self.client.get(url).send().await?.error_for_status()?;
        response.bytes().await?;

        Ok(start.elapsed())
    }
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

    headers
}

/// `Url::join` replaces the last path segment unless the base ends in `/`.
fn with_trailing_slash(server: &Url) -> Url {
    let mut base = server.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

use super::metadata_name;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use std::num::NonZeroU64;
use std::time::Duration;
use tracing::debug;
use tuf_ota_common::remote::{ByteStream, TransportError, TufTransport};
use tuf_ota_common::{RoleType, Version};
use url::Url;

/// Fetches metadata and targets from an HTTP(S) server.
///
/// Metadata requests are bounded by the request timeout as a whole. Target bodies are only
/// bounded by the connect timeout, readers apply their own per-chunk timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    metadata_url: Url,
    targets_url: Url,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        metadata_url: Url,
        targets_url: Url,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(HttpTransport {
            client,
            metadata_url,
            targets_url,
            timeout,
        })
    }

    async fn get(
        &self,
        base: &Url,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Response, TransportError> {
        let url = base
            .join(name)
            .map_err(|_| TransportError::NotFound(name.to_string()))?;
        debug!("GET {url}");
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(name, e))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(TransportError::NotFound(name.to_string())),
            status => Err(TransportError::Status {
                path: name.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        self.get(&self.metadata_url, name, Some(self.timeout))
            .await?
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| map_reqwest_error(name, e))
    }
}

fn map_reqwest_error(name: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(name.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Read {
            path: name.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl TufTransport for HttpTransport {
    async fn fetch_root(&self, version: NonZeroU64) -> Result<Vec<u8>, TransportError> {
        self.fetch_metadata(&format!("{version}.root.json")).await
    }

    async fn fetch_timestamp(&self) -> Result<Vec<u8>, TransportError> {
        self.fetch_metadata(&metadata_name(RoleType::Timestamp, None))
            .await
    }

    async fn fetch_snapshot(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        self.fetch_metadata(&metadata_name(RoleType::Snapshot, version))
            .await
    }

    async fn fetch_targets(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        self.fetch_metadata(&metadata_name(RoleType::Targets, version))
            .await
    }

    async fn fetch_target(&self, metapath: &str) -> Result<ByteStream, TransportError> {
        let response = self.get(&self.targets_url, metapath, None).await?;
        let name = metapath.to_string();
        Ok(response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(move |e| map_reqwest_error(&name, e))
            .boxed())
    }
}

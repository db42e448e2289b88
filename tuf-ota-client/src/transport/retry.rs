use crate::config::ClientConfig;
use async_trait::async_trait;
use std::future::Future;
use std::num::NonZeroU64;
use std::time::Duration;
use tracing::warn;
use tuf_ota_common::remote::{ByteStream, TransportError, TufTransport};
use tuf_ota_common::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// retries after the first attempt
    pub max_retries: u32,
    /// delay before the first retry, doubled for every further retry
    pub base_delay: Duration,
    /// upper bound for a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            timeout: config.request_timeout,
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Wraps a transport with a timeout per attempt and retries with exponential backoff.
/// Only [TransportError::is_retryable] errors are retried, after the last attempt the error is
/// handed to the caller.
#[derive(Debug, Clone)]
pub struct RetryTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: TufTransport> RetryTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        RetryTransport { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn retry<F, Fut, R>(&self, name: &str, f: F) -> Result<R, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut retry = 0;
        loop {
            let err = match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => TransportError::Timeout(name.to_string()),
            };
            if !err.is_retryable() || retry >= self.policy.max_retries {
                return Err(err);
            }
            let delay = self.policy.delay(retry);
            retry += 1;
            warn!(
                "fetching {name} failed: {err}, retry {retry}/{} in {delay:?}",
                self.policy.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<T: TufTransport> TufTransport for RetryTransport<T> {
    async fn fetch_root(&self, version: NonZeroU64) -> Result<Vec<u8>, TransportError> {
        self.retry(&format!("{version}.root.json"), || self.inner.fetch_root(version))
            .await
    }

    async fn fetch_timestamp(&self) -> Result<Vec<u8>, TransportError> {
        self.retry("timestamp.json", || self.inner.fetch_timestamp())
            .await
    }

    async fn fetch_snapshot(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        self.retry("snapshot.json", || self.inner.fetch_snapshot(version))
            .await
    }

    async fn fetch_targets(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        self.retry("targets.json", || self.inner.fetch_targets(version))
            .await
    }

    /// Retries opening the stream. Failures while reading the body are left to the reader.
    async fn fetch_target(&self, metapath: &str) -> Result<ByteStream, TransportError> {
        self.retry(metapath, || self.inner.fetch_target(metapath))
            .await
    }
}

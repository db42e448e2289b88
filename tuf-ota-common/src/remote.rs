use crate::Version;
use async_trait::async_trait;
use core::num::NonZeroU64;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote does not have the requested file.
    #[error("remote file not found: {0}")]
    NotFound(String),
    /// The request did not finish within the configured timeout.
    #[error("request for {0} timed out")]
    Timeout(String),
    /// Failed to connect to the remote host.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The connection broke while reading the body.
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    /// The remote sent more bytes than allowed for this file.
    #[error("remote sent more than {limit} bytes for {path}")]
    TooLarge { path: String, limit: u64 },
    #[error("unexpected status {status} for {path}")]
    Status { path: String, status: u16 },
}

impl TransportError {
    /// Whether a retry of the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Read { .. } => {
                true
            }
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::NotFound(_) | TransportError::TooLarge { .. } => false,
        }
    }
}

/// Body of a target file, delivered in chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Trait that is used represent the communication with a remote TUF repository.
#[async_trait]
pub trait TufTransport: Send + Sync {
    /// Fetches the root file with the given version number.
    async fn fetch_root(&self, version: NonZeroU64) -> Result<Vec<u8>, TransportError>;
    /// Fetches the most recent timestamp provided by the remote.
    async fn fetch_timestamp(&self) -> Result<Vec<u8>, TransportError>;
    /// Fetches the snapshot with the given version, or the most recent one for `None`.
    async fn fetch_snapshot(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError>;
    /// Fetches the targets with the given version, or the most recent one for `None`.
    async fn fetch_targets(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError>;
    /// Opens a stream for the target file with the name provided in `metapath`.
    async fn fetch_target(&self, metapath: &str) -> Result<ByteStream, TransportError>;

    /// Fetches a whole target file, refusing more than `limit` bytes.
    async fn fetch_target_bytes(
        &self,
        metapath: &str,
        limit: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.fetch_target(metapath).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
            if out.len() as u64 > limit {
                return Err(TransportError::TooLarge {
                    path: metapath.to_string(),
                    limit,
                });
            }
        }
        Ok(out)
    }
}

use std::path::PathBuf;
use thiserror::Error;
use tuf_ota_common::remote::TransportError;
use tuf_ota_common::{ErrorKind, TufError};

use crate::session::Phase;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("metadata verification failed: {0}")]
    Tuf(#[from] TufError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    // downloaded bytes do not match the trusted targets metadata
    #[error("integrity check failed for {metapath}: {reason}")]
    IntegrityFailure { metapath: String, reason: String },
    #[error("installation failed: {0}")]
    InstallFailure(String),
    #[error("another update session is in progress")]
    SessionAlreadyInProgress,
    #[error("update was cancelled")]
    Cancelled,
    #[error("illegal session transition from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("error during I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UpdateError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> UpdateError {
        let path = path.into();
        move |source| UpdateError::Io { path, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Tuf(e) => e.kind(),
            UpdateError::Transport(_) => ErrorKind::Transport,
            UpdateError::IntegrityFailure { .. } => ErrorKind::Integrity,
            UpdateError::InstallFailure(_) | UpdateError::Io { .. } => ErrorKind::Install,
            UpdateError::SessionAlreadyInProgress
            | UpdateError::Cancelled
            | UpdateError::InvalidTransition { .. }
            | UpdateError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Transport failures can be retried by the caller, for example on the next check interval.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

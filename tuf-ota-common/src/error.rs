use crate::remote::TransportError;
use crate::{RoleType, Threshold, Version};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Coarse classification of failures, shared by the metadata and the update layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Trust,
    Transport,
    Integrity,
    Install,
    Configuration,
}

impl ErrorKind {
    /// Only transport failures are worth retrying, everything else needs a changed input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transport)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TufError {
    // a listed key produced a signature that could not be decoded or did not verify
    #[error("bad signature from key {key_id}")]
    BadSignature { key_id: String },
    // fewer signatures than threshold -> arbitrary software attack possible
    #[error("{role} metadata has {valid} valid signatures, threshold is {threshold}")]
    InsufficientSignatures {
        role: RoleType,
        valid: usize,
        threshold: Threshold,
    },
    // the expiration timestamp must be after the fixed update start time -> freeze attack
    #[error("{role} metadata expired at {expires}")]
    ExpiredMetadata {
        role: RoleType,
        expires: DateTime<Utc>,
    },
    // version lower than the one already trusted -> rollback attack
    #[error("rollback detected for {role}: trusted version {trusted}, offered version {offered}")]
    RollbackDetected {
        role: RoleType,
        trusted: Version,
        offered: Version,
    },
    // endless chain of root files -> resource exhaustion
    #[error("more than {max} root rotations in a single update")]
    TooManyRootRotations { max: u32 },
    // a file of one role served in place of another -> mix-and-match attack
    #[error("expected {expected} metadata, found `{found}`")]
    RoleMismatch { expected: RoleType, found: String },
    // new version number has to be exactly the one referenced (N+1 for root)
    #[error("invalid version for {role}: expected {expected}, found {found}")]
    InvalidNewVersionNumber {
        role: RoleType,
        expected: Version,
        found: Version,
    },
    #[error("hash mismatch for {metapath}")]
    InvalidHash { metapath: String },
    #[error("length mismatch for {metapath}: expected {expected}, got {actual}")]
    InvalidLength {
        metapath: String,
        expected: u64,
        actual: u64,
    },
    // could not find keys for a role
    #[error("root does not define keys for {0}")]
    MissingRoleKeys(RoleType),
    #[error("no trusted timestamp metadata")]
    MissingTimestampFile,
    #[error("no trusted snapshot metadata")]
    MissingSnapshotFile,
    #[error("no trusted targets metadata")]
    MissingTargetsFile,
    #[error("no metadata for {metapath}")]
    MissingTargetMetadata { metapath: String },
    #[error("no supported hash for {metapath}")]
    NoSupportedHash { metapath: String },
    #[error("invalid threshold for {role}: must be at least 1 and at most the number of keys")]
    InvalidRoleThreshold { role: RoleType },
    #[error("{role} needs {threshold} signing keys, only {available} available")]
    InsufficientSigningKeys {
        role: RoleType,
        available: usize,
        threshold: Threshold,
    },
    #[error("failed to decode public key")]
    DecodingPublicKeyFailed,
    #[error("failed to decode signature")]
    DecodingSignatureFailed,
    #[error("unsupported key algorithm {0}")]
    UnsupportedKeyAlgorithm(String),
    #[error("decoding failed: {0}")]
    DecodingError(String),
    #[error("encoding failed: {0}")]
    EncodingError(String),
    // the client was not able to persistently store metadata
    #[error("could not persist metadata: {0}")]
    CouldNotPersistMetadata(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TufError {
    pub fn kind(&self) -> ErrorKind {
        use TufError::*;
        match self {
            Transport(_) => ErrorKind::Transport,
            InsufficientSigningKeys { .. }
            | InvalidRoleThreshold { .. }
            | DecodingPublicKeyFailed
            | DecodingSignatureFailed
            | UnsupportedKeyAlgorithm(_)
            | DecodingError(_)
            | EncodingError(_)
            | CouldNotPersistMetadata(_) => ErrorKind::Configuration,
            _ => ErrorKind::Trust,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

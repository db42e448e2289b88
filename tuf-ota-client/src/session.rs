use crate::error::UpdateError;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A newer version found in the trusted targets metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: semver::Version,
    /// target path of the full artifact
    pub metapath: String,
    pub length: u64,
    /// target path of a patch from the installed version, if the repository offers one
    pub patch: Option<String>,
}

/// State of the update session, see [transition] for the allowed moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Checking,
    UpToDate { version: semver::Version },
    UpdateAvailable(VersionInfo),
    Downloading { downloaded: u64, total: u64 },
    Verifying,
    Patching,
    BackingUp,
    Installing,
    RestartPending { version: semver::Version },
    RolledBack { version: semver::Version, reason: String },
    Failed { reason: String },
}

/// Data-less mirror of [SessionState] for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Patching,
    BackingUp,
    Installing,
    RestartPending,
    RolledBack,
    Failed,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Idle => Phase::Idle,
            SessionState::Checking => Phase::Checking,
            SessionState::UpToDate { .. } => Phase::UpToDate,
            SessionState::UpdateAvailable(_) => Phase::UpdateAvailable,
            SessionState::Downloading { .. } => Phase::Downloading,
            SessionState::Verifying => Phase::Verifying,
            SessionState::Patching => Phase::Patching,
            SessionState::BackingUp => Phase::BackingUp,
            SessionState::Installing => Phase::Installing,
            SessionState::RestartPending { .. } => Phase::RestartPending,
            SessionState::RolledBack { .. } => Phase::RolledBack,
            SessionState::Failed { .. } => Phase::Failed,
        }
    }
}

impl Phase {
    /// Phases in which a cancellation request is honored.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Phase::Checking
                | Phase::UpdateAvailable
                | Phase::Downloading
                | Phase::Verifying
                | Phase::Patching
                | Phase::BackingUp
        )
    }

    /// Phases that end a session.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Phase::UpToDate | Phase::RestartPending | Phase::RolledBack | Phase::Failed
        )
    }

    /// Phases that may touch the live install directory.
    pub fn touches_install_dir(&self) -> bool {
        matches!(self, Phase::Installing)
    }
}

/// Checks whether the session may move from `from` to `to`.
///
/// Every phase before [Phase::Installing] may return to [Phase::Idle] on cancellation, once
/// installing began the session ends in [Phase::RestartPending], [Phase::RolledBack] or
/// [Phase::Failed].
pub fn transition(from: Phase, to: Phase) -> Result<(), UpdateError> {
    use Phase::*;
    let allowed = match (from, to) {
        (from, Idle) if from.is_cancellable() => true,
        (from, Checking) => from.is_final() || matches!(from, Idle | UpdateAvailable),
        (from, Idle) if from.is_final() => true,
        (Checking, UpToDate | UpdateAvailable | Failed) => true,
        (UpdateAvailable, Downloading | Failed) => true,
        // progress updates
        (Downloading, Downloading) => true,
        (Downloading, Verifying | Failed) => true,
        // a verified patch is applied, a failed patch falls back to the full artifact
        (Verifying, Patching | BackingUp | Downloading | Failed) => true,
        (Patching, Verifying | Downloading | Failed) => true,
        (BackingUp, Installing | Failed) => true,
        (Installing, RestartPending | RolledBack | Failed) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(UpdateError::InvalidTransition { from, to })
    }
}

/// Bookkeeping of one update attempt, created when an update is detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub installed_version: semver::Version,
    pub target: VersionInfo,
    pub downloaded_bytes: u64,
    pub verified: bool,
    pub patched: bool,
    pub backup_path: Option<PathBuf>,
}

impl UpdateSession {
    pub fn new(installed_version: semver::Version, target: VersionInfo) -> Self {
        UpdateSession {
            installed_version,
            target,
            downloaded_bytes: 0,
            verified: false,
            patched: false,
            backup_path: None,
        }
    }
}

/// Advisory lock that allows a single update session per data directory.
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct SessionLock {
    _file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Takes the lock without blocking, a held lock results in
    /// [UpdateError::SessionAlreadyInProgress].
    pub fn try_acquire(path: &Path) -> Result<Self, UpdateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(UpdateError::io(parent))?;
        }
        let file = File::create(path).map_err(UpdateError::io(path))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired session lock {path:?}");
                Ok(SessionLock {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                info!("session lock {path:?} is held by another session");
                Err(UpdateError::SessionAlreadyInProgress)
            }
            Err(e) => Err(UpdateError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

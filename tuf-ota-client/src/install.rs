use crate::error::UpdateError;
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File inside the install directory that records the installed version.
pub const VERSION_MARKER: &str = ".tuf-ota-version";

/// Reads the version marker of `install_dir`, falling back to `fallback` if there is none.
pub fn read_installed_version(install_dir: &Path, fallback: &semver::Version) -> semver::Version {
    let path = install_dir.join(VERSION_MARKER);
    match fs::read_to_string(&path) {
        Ok(content) => match content.trim().parse() {
            Ok(version) => version,
            Err(e) => {
                warn!("ignoring invalid version marker {path:?}: {e}");
                fallback.clone()
            }
        },
        Err(_) => fallback.clone(),
    }
}

/// Turns a verified artifact into the contents of an install directory.
pub trait Installer: Send + Sync {
    /// Fills the empty directory `staging` from the artifact at `artifact`, published as
    /// `metapath`.
    fn stage(&self, artifact: &Path, metapath: &str, staging: &Path) -> Result<(), UpdateError>;

    /// Runs after the new version was moved into place. An error rolls the installation back.
    fn post_install(&self, _install_dir: &Path) -> Result<(), UpdateError> {
        Ok(())
    }
}

/// Unpacks gzip tarballs (`.tar.gz`, `.tgz`), other artifacts are copied as a single file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveInstaller;

impl ArchiveInstaller {
    fn is_archive(metapath: &str) -> bool {
        metapath.ends_with(".tar.gz") || metapath.ends_with(".tgz")
    }

    fn unpack(artifact: &Path, staging: &Path) -> Result<(), UpdateError> {
        let file = fs::File::open(artifact).map_err(UpdateError::io(artifact))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let entries = archive
            .entries()
            .map_err(|e| UpdateError::InstallFailure(format!("failed to read archive: {e}")))?;
        for entry in entries {
            let mut entry = entry
                .map_err(|e| UpdateError::InstallFailure(format!("failed to read archive: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| UpdateError::InstallFailure(format!("invalid entry path: {e}")))?
                .into_owned();
            if !path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(UpdateError::InstallFailure(format!(
                    "archive entry {path:?} escapes the install directory"
                )));
            }
            let unpacked = entry.unpack_in(staging).map_err(|e| {
                UpdateError::InstallFailure(format!("failed to unpack {path:?}: {e}"))
            })?;
            if !unpacked {
                return Err(UpdateError::InstallFailure(format!(
                    "archive entry {path:?} was refused"
                )));
            }
        }
        Ok(())
    }
}

impl Installer for ArchiveInstaller {
    fn stage(&self, artifact: &Path, metapath: &str, staging: &Path) -> Result<(), UpdateError> {
        if Self::is_archive(metapath) {
            debug!("unpacking {artifact:?} into {staging:?}");
            return Self::unpack(artifact, staging);
        }
        let name = Path::new(metapath)
            .file_name()
            .ok_or_else(|| UpdateError::InstallFailure(format!("invalid artifact {metapath}")))?;
        let dest = staging.join(name);
        fs::copy(artifact, &dest).map_err(UpdateError::io(&dest))?;
        Ok(())
    }
}

/// Sibling directory into which a new version is staged.
pub fn staging_dir(install_dir: &Path, version: &semver::Version) -> PathBuf {
    sibling(install_dir, &format!("staging-{version}"))
}

/// Sibling directory that holds the previous version during the swap.
pub fn old_dir(install_dir: &Path) -> PathBuf {
    sibling(install_dir, "old")
}

pub(crate) fn sibling(install_dir: &Path, suffix: &str) -> PathBuf {
    let name = install_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    install_dir.with_file_name(format!("{name}.{suffix}"))
}

fn staging_dirs(install_dir: &Path) -> Vec<PathBuf> {
    let prefix = sibling(install_dir, "staging-")
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(parent) = install_dir.parent() else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect()
}

fn remove_dir_if_exists(path: &Path) -> Result<(), UpdateError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdateError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Stages `artifact` next to `install_dir` and swaps it into place.
///
/// Only the two renames touch the live directory. A crash at any point leaves a state that
/// [recover] turns into either the old or the new version.
pub fn install(
    installer: &dyn Installer,
    artifact: &Path,
    metapath: &str,
    install_dir: &Path,
    version: &semver::Version,
) -> Result<(), UpdateError> {
    let staging = staging_dir(install_dir, version);
    remove_dir_if_exists(&staging)?;
    fs::create_dir_all(&staging).map_err(UpdateError::io(&staging))?;
    let staged = installer.stage(artifact, metapath, &staging).and_then(|_| {
        let marker = staging.join(VERSION_MARKER);
        fs::write(&marker, version.to_string()).map_err(UpdateError::io(marker))
    });
    if let Err(e) = staged {
        let _ = remove_dir_if_exists(&staging);
        return Err(e);
    }
    swap_into_place(&staging, install_dir)?;
    info!("installed version {version} into {install_dir:?}");
    Ok(())
}

/// Replaces `install_dir` with the complete directory `staging`.
fn swap_into_place(staging: &Path, install_dir: &Path) -> Result<(), UpdateError> {
    let old = old_dir(install_dir);
    remove_dir_if_exists(&old)?;
    let had_previous = install_dir.exists();
    if had_previous {
        fs::rename(install_dir, &old).map_err(UpdateError::io(install_dir))?;
    }
    if let Err(e) = fs::rename(staging, install_dir) {
        if had_previous {
            if let Err(e) = fs::rename(&old, install_dir) {
                warn!("failed to move {old:?} back: {e}");
            }
        }
        return Err(UpdateError::InstallFailure(format!(
            "failed to move {staging:?} into place: {e}"
        )));
    }
    if let Err(e) = remove_dir_if_exists(&old) {
        warn!("failed to remove previous version: {e}");
    }
    Ok(())
}

/// What [recover] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// no interrupted installation
    Clean,
    /// a staged version was never moved into place and was removed
    DiscardedStaging,
    /// the staged version had replaced nothing yet, it was moved into place
    CompletedSwap,
    /// the new version was in place, the leftover previous version was removed
    RemovedOld,
    /// only the previous version was left, it was moved back
    RestoredOld,
}

/// Brings `install_dir` back to a complete version after an interrupted [install].
pub fn recover(install_dir: &Path) -> Result<RecoveryAction, UpdateError> {
    let old = old_dir(install_dir);
    let mut staging = staging_dirs(install_dir);
    // staged directories are complete once they carry the version marker
    staging.sort_by_key(|p| !p.join(VERSION_MARKER).exists());
    let action = match (install_dir.exists(), old.exists(), staging.first()) {
        (true, true, _) => {
            remove_dir_if_exists(&old)?;
            RecoveryAction::RemovedOld
        }
        (false, true, Some(candidate)) if candidate.join(VERSION_MARKER).exists() => {
            fs::rename(candidate, install_dir).map_err(UpdateError::io(candidate))?;
            remove_dir_if_exists(&old)?;
            RecoveryAction::CompletedSwap
        }
        (false, true, _) => {
            fs::rename(&old, install_dir).map_err(UpdateError::io(&old))?;
            RecoveryAction::RestoredOld
        }
        (_, false, Some(_)) => RecoveryAction::DiscardedStaging,
        (_, false, None) => RecoveryAction::Clean,
    };
    for dir in staging_dirs(install_dir) {
        remove_dir_if_exists(&dir)?;
    }
    if action != RecoveryAction::Clean {
        warn!("recovered interrupted installation in {install_dir:?}: {action:?}");
    }
    Ok(action)
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), UpdateError> {
    fs::create_dir_all(to).map_err(UpdateError::io(to))?;
    if !from.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| UpdateError::Io {
            path: from.to_path_buf(),
            source: e.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| UpdateError::InstallFailure(e.to_string()))?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(UpdateError::io(&dest))?;
        } else {
            fs::copy(entry.path(), &dest).map_err(UpdateError::io(&dest))?;
        }
    }
    Ok(())
}

/// Copies the complete install directory to `{backups_dir}/backup_{version}`.
pub fn backup(
    install_dir: &Path,
    backups_dir: &Path,
    version: &semver::Version,
) -> Result<PathBuf, UpdateError> {
    let path = backups_dir.join(format!("backup_{version}"));
    remove_dir_if_exists(&path)?;
    copy_dir(install_dir, &path)?;
    info!("backed up {install_dir:?} to {path:?}");
    Ok(path)
}

/// Puts the contents of `backup` back into `install_dir` with the same swap as [install].
pub fn restore(backup: &Path, install_dir: &Path) -> Result<(), UpdateError> {
    let staging = sibling(install_dir, "staging-restore");
    remove_dir_if_exists(&staging)?;
    copy_dir(backup, &staging)?;
    swap_into_place(&staging, install_dir)?;
    info!("restored {install_dir:?} from {backup:?}");
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_downloads: usize,
    pub removed_backups: usize,
}

/// Removes partial downloads and every backup but the most recent one.
pub fn cleanup(downloads_dir: &Path, backups_dir: &Path) -> Result<CleanupReport, UpdateError> {
    let mut report = CleanupReport::default();
    if let Ok(entries) = fs::read_dir(downloads_dir) {
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(UpdateError::io(&path))?;
            report.removed_downloads += 1;
        }
    }
    if let Ok(entries) = fs::read_dir(backups_dir) {
        let mut backups = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup_"))
            .map(|e| {
                let modified = e
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, e.path())
            })
            .collect::<Vec<_>>();
        backups.sort();
        backups.pop();
        for (_, path) in backups {
            remove_dir_if_exists(&path)?;
            report.removed_backups += 1;
        }
    }
    debug!("cache cleanup: {report:?}");
    Ok(report)
}

use crate::error::UpdateError;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use tuf_ota::role::root::check_role_thresholds;
use tuf_ota::role::DecodeRole;
use tuf_ota_common::storage::TufStorage;
use tuf_ota_common::{RoleType, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::Signed;

/// [TufStorage] backed by a metadata directory, laid out like the remote:
/// `{N}.root.json`, `timestamp.json`, `snapshot.json` and `targets.json`.
///
/// Files are kept in memory and written through on every change. Staged roots only touch the
/// disk when they are committed.
#[derive(Debug)]
pub struct FilesystemStorage {
    dir: PathBuf,
    roots: BTreeMap<Version, Vec<u8>>,
    uncommitted_roots: Vec<(Version, Vec<u8>)>,
    timestamp: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
    targets: Option<Vec<u8>>,
}

impl FilesystemStorage {
    /// Opens the metadata directory at `dir`. If it does not contain any root yet, it is
    /// seeded with `initial_root`.
    pub fn open(dir: &Path, initial_root: &Path) -> Result<Self, UpdateError> {
        std::fs::create_dir_all(dir).map_err(UpdateError::io(dir))?;
        let mut roots = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(UpdateError::io(dir))? {
            let path = entry.map_err(UpdateError::io(dir))?.path();
            let Some(version) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".root.json"))
                .and_then(|v| v.parse::<Version>().ok())
            else {
                continue;
            };
            roots.insert(version, std::fs::read(&path).map_err(UpdateError::io(&path))?);
        }
        if roots.is_empty() {
            let data = std::fs::read(initial_root).map_err(UpdateError::io(initial_root))?;
            let initial = Signed::<Root>::decode_role(&data)?;
            check_role_thresholds(&initial.signed)?;
            let version = initial.signed.version;
            info!("seeding trusted metadata with root version {version}");
            write_atomic(&dir.join(format!("{version}.root.json")), &data)?;
            roots.insert(version, data);
        }
        let read_optional = |role: RoleType| -> Result<Option<Vec<u8>>, UpdateError> {
            let path = dir.join(role.metapath());
            match std::fs::read(&path) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(UpdateError::Io { path, source: e }),
            }
        };
        Ok(FilesystemStorage {
            dir: dir.to_path_buf(),
            roots,
            uncommitted_roots: Vec::new(),
            timestamp: read_optional(RoleType::Timestamp)?,
            snapshot: read_optional(RoleType::Snapshot)?,
            targets: read_optional(RoleType::Targets)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Versions of all trusted roots.
    pub fn root_versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.roots.keys().copied()
    }

    fn persist(&self, role: RoleType, data: &[u8]) -> Result<(), TufError> {
        write_atomic(&self.dir.join(role.metapath()), data)
            .map_err(|e| TufError::CouldNotPersistMetadata(e.to_string()))
    }

    fn delete(&self, role: RoleType) -> Result<(), TufError> {
        let path = self.dir.join(role.metapath());
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TufError::CouldNotPersistMetadata(format!(
                "failed to remove {path:?}: {e}"
            ))),
        }
    }
}

impl TufStorage for FilesystemStorage {
    fn delete_timestamp_metadata(&mut self) -> Result<(), TufError> {
        self.delete(RoleType::Timestamp)?;
        self.timestamp = None;
        Ok(())
    }

    fn delete_snapshot_metadata(&mut self) -> Result<(), TufError> {
        self.delete(RoleType::Snapshot)?;
        self.snapshot = None;
        Ok(())
    }

    fn persist_root(&mut self, version: Version, data: &[u8]) -> Result<(), TufError> {
        self.uncommitted_roots.push((version, data.to_vec()));
        Ok(())
    }

    fn persist_timestamp(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.persist(RoleType::Timestamp, data)?;
        self.timestamp = Some(data.to_vec());
        Ok(())
    }

    fn persist_snapshot(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.persist(RoleType::Snapshot, data)?;
        self.snapshot = Some(data.to_vec());
        Ok(())
    }

    fn persist_targets(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.persist(RoleType::Targets, data)?;
        self.targets = Some(data.to_vec());
        Ok(())
    }

    fn commit_root(&mut self) -> Result<(), TufError> {
        if self.uncommitted_roots.is_empty() {
            return Err(TufError::CouldNotPersistMetadata(
                "no staged root to commit".to_string(),
            ));
        }
        for (version, data) in self.uncommitted_roots.drain(..) {
            write_atomic(&self.dir.join(format!("{version}.root.json")), &data)
                .map_err(|e| TufError::CouldNotPersistMetadata(e.to_string()))?;
            debug!("committed root version {version}");
            self.roots.insert(version, data);
        }
        Ok(())
    }

    fn discard_uncommitted_roots(&mut self) {
        if !self.uncommitted_roots.is_empty() {
            warn!("discarding {} staged roots", self.uncommitted_roots.len());
        }
        self.uncommitted_roots.clear();
    }

    fn current_root(&self) -> &[u8] {
        self.roots
            .values()
            .next_back()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn current_uncommitted_root(&self) -> Option<&[u8]> {
        self.uncommitted_roots.last().map(|(_, data)| data.as_slice())
    }

    fn current_timestamp(&self) -> Option<&[u8]> {
        self.timestamp.as_deref()
    }

    fn current_snapshot(&self) -> Option<&[u8]> {
        self.snapshot.as_deref()
    }

    fn current_targets(&self) -> Option<&[u8]> {
        self.targets.as_deref()
    }
}

/// Replaces the file at `path` through a temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), UpdateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(UpdateError::io(parent))?;
    let mut file = NamedTempFile::new_in(parent).map_err(UpdateError::io(parent))?;
    file.write_all(data).map_err(UpdateError::io(path))?;
    file.as_file().sync_all().map_err(UpdateError::io(path))?;
    file.persist(path).map_err(|e| UpdateError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

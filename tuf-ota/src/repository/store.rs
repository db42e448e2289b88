use super::RepositoryError;
use crate::role::DecodeRole;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;
use tuf_ota_common::{RoleType, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::Snapshot;
use tuf_ota_json::targets::Targets;
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::Signed;

/// Signed metadata of a repository. Roots are kept as a gap-free chain starting at version 1.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    roots: BTreeMap<Version, Signed<Root>>,
    timestamp: Option<Signed<Timestamp>>,
    snapshot: Option<Signed<Snapshot>>,
    targets: Option<Signed<Targets>>,
}

impl MetadataStore {
    /// Reads `{N}.root.json`, `timestamp.json`, `snapshot.json` and `targets.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self, RepositoryError> {
        let mut store = MetadataStore::default();
        let entries = std::fs::read_dir(dir).map_err(|source| RepositoryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut roots = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|source| RepositoryError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(version) = name
                .strip_suffix(".root.json")
                .and_then(|v| v.parse::<Version>().ok())
            {
                roots.insert(version, Signed::<Root>::decode_role(&read(&path)?)?);
            }
        }
        for root in roots.into_values() {
            store.push_root(root)?;
        }
        store.timestamp = read_optional(&dir.join(RoleType::Timestamp.metapath()))?;
        store.snapshot = read_optional(&dir.join(RoleType::Snapshot.metapath()))?;
        store.targets = read_optional(&dir.join(RoleType::Targets.metapath()))?;
        Ok(store)
    }

    /// Appends `root` to the chain. Its version has to follow the newest root.
    pub fn push_root(&mut self, root: Signed<Root>) -> Result<(), RepositoryError> {
        let expected = self.root().map(|r| r.signed.version + 1).unwrap_or(1);
        if root.signed.version != expected {
            return Err(TufError::InvalidNewVersionNumber {
                role: RoleType::Root,
                expected,
                found: root.signed.version,
            }
            .into());
        }
        self.roots.insert(root.signed.version, root);
        Ok(())
    }

    /// The newest root.
    pub fn root(&self) -> Option<&Signed<Root>> {
        self.roots.values().next_back()
    }

    pub fn root_version(&self, version: Version) -> Option<&Signed<Root>> {
        self.roots.get(&version)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Signed<Root>> {
        self.roots.values()
    }

    pub fn timestamp(&self) -> Option<&Signed<Timestamp>> {
        self.timestamp.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Signed<Snapshot>> {
        self.snapshot.as_ref()
    }

    pub fn targets(&self) -> Option<&Signed<Targets>> {
        self.targets.as_ref()
    }

    pub fn set_timestamp(&mut self, timestamp: Signed<Timestamp>) {
        self.timestamp = Some(timestamp);
    }

    pub fn set_snapshot(&mut self, snapshot: Signed<Snapshot>) {
        self.snapshot = Some(snapshot);
    }

    pub fn set_targets(&mut self, targets: Signed<Targets>) {
        self.targets = Some(targets);
    }

    /// Writes every file to `dir`. With consistent snapshots the versioned snapshot and targets
    /// files are written as well. The timestamp is written last.
    pub fn write(&self, dir: &Path) -> Result<(), RepositoryError> {
        std::fs::create_dir_all(dir).map_err(|source| RepositoryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for (version, root) in self.roots.iter() {
            write_atomic(&dir.join(format!("{version}.root.json")), &root.to_json()?)?;
        }
        let consistent = self
            .root()
            .map(|r| r.signed.consistent_snapshot)
            .unwrap_or(false);
        if let Some(targets) = &self.targets {
            let data = targets.to_json()?;
            if consistent {
                let name = format!("{}.{}", targets.signed.version, RoleType::Targets.metapath());
                write_atomic(&dir.join(name), &data)?;
            }
            write_atomic(&dir.join(RoleType::Targets.metapath()), &data)?;
        }
        if let Some(snapshot) = &self.snapshot {
            let data = snapshot.to_json()?;
            if consistent {
                let name = format!(
                    "{}.{}",
                    snapshot.signed.version,
                    RoleType::Snapshot.metapath()
                );
                write_atomic(&dir.join(name), &data)?;
            }
            write_atomic(&dir.join(RoleType::Snapshot.metapath()), &data)?;
        }
        if let Some(timestamp) = &self.timestamp {
            write_atomic(
                &dir.join(RoleType::Timestamp.metapath()),
                &timestamp.to_json()?,
            )?;
        }
        Ok(())
    }
}

fn read(path: &Path) -> Result<Vec<u8>, RepositoryError> {
    std::fs::read(path).map_err(|source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional<T>(path: &Path) -> Result<Option<Signed<T>>, RepositoryError>
where
    Signed<T>: DecodeRole,
{
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Signed::<T>::decode_role(&read(path)?)?))
}

/// Replaces the file at `path` so that readers see either the old or the new content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RepositoryError> {
    let io_err = |source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_err)?;
    let mut file = NamedTempFile::new_in(parent).map_err(io_err)?;
    file.write_all(data).map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    debug!("wrote {}", path.display());
    Ok(())
}

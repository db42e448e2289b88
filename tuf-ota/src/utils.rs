use async_trait::async_trait;
use core::num::NonZeroU64;
use futures::stream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::Path;
use tuf_ota_common::remote::{ByteStream, TransportError, TufTransport};
use tuf_ota_common::storage::TufStorage;
use tuf_ota_common::{TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::Signed;

use crate::role::DecodeRole;

/// Size of the chunks in which [MemoryTransport] streams target files.
const CHUNK_SIZE: usize = 4096;

/// A transport that serves a repository from memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    pub roots: BTreeMap<u64, Vec<u8>>,
    pub timestamp: Option<Vec<u8>>,
    /// Latest snapshot, served for unversioned requests.
    pub snapshot: Option<Vec<u8>>,
    pub snapshots: BTreeMap<Version, Vec<u8>>,
    /// Latest targets, served for unversioned requests.
    pub targets: Option<Vec<u8>>,
    pub targets_versions: BTreeMap<Version, Vec<u8>>,
    pub target_files: BTreeMap<String, Vec<u8>>,
}

impl MemoryTransport {
    /// Serve every root of `roots` under its version.
    pub fn with_roots(mut self, roots: &[Signed<Root>]) -> Result<Self, TufError> {
        for root in roots {
            self.roots
                .insert(root.signed.version as u64, root.to_json()?);
        }
        Ok(self)
    }

    /// Serve `data` as `{version}.root.json`, whatever it contains.
    pub fn with_root_at(mut self, version: u64, data: Vec<u8>) -> Self {
        self.roots.insert(version, data);
        self
    }

    pub fn with_timestamp(mut self, data: Vec<u8>) -> Self {
        self.timestamp = Some(data);
        self
    }

    pub fn with_snapshot(mut self, version: Version, data: Vec<u8>) -> Self {
        self.snapshots.insert(version, data.clone());
        self.snapshot = Some(data);
        self
    }

    pub fn with_targets(mut self, version: Version, data: Vec<u8>) -> Self {
        self.targets_versions.insert(version, data.clone());
        self.targets = Some(data);
        self
    }

    pub fn with_target_file(mut self, metapath: &str, data: Vec<u8>) -> Self {
        self.target_files.insert(metapath.to_string(), data);
        self
    }

    /// Loads a repository directory with `metadata/` and `targets/` as written by
    /// [crate::repository::Repository].
    pub fn from_repository_dir(dir: &Path) -> std::io::Result<Self> {
        let mut transport = MemoryTransport::default();
        for entry in std::fs::read_dir(dir.join("metadata"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let data = std::fs::read(entry.path())?;
            match name.split_once('.') {
                Some(("timestamp", "json")) => transport.timestamp = Some(data),
                Some(("snapshot", "json")) => transport.snapshot = Some(data),
                Some(("targets", "json")) => transport.targets = Some(data),
                Some((version, rest)) => {
                    let Ok(version) = version.parse::<Version>() else {
                        continue;
                    };
                    match rest {
                        "root.json" => {
                            transport.roots.insert(version as u64, data);
                        }
                        "snapshot.json" => {
                            transport.snapshots.insert(version, data);
                        }
                        "targets.json" => {
                            transport.targets_versions.insert(version, data);
                        }
                        _ => {}
                    }
                }
                None => {}
            }
        }
        let targets_dir = dir.join("targets");
        if targets_dir.is_dir() {
            collect_target_files(&targets_dir, &targets_dir, &mut transport.target_files)?;
        }
        Ok(transport)
    }
}

fn collect_target_files(
    base: &Path,
    dir: &Path,
    out: &mut BTreeMap<String, Vec<u8>>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_target_files(base, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            let metapath = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(metapath, std::fs::read(&path)?);
        }
    }
    Ok(())
}

fn lookup(
    file: Option<&Vec<u8>>,
    name: impl FnOnce() -> String,
) -> Result<Vec<u8>, TransportError> {
    file.cloned().ok_or_else(|| TransportError::NotFound(name()))
}

#[async_trait]
impl TufTransport for MemoryTransport {
    async fn fetch_root(&self, version: NonZeroU64) -> Result<Vec<u8>, TransportError> {
        lookup(self.roots.get(&version.get()), || {
            format!("{version}.root.json")
        })
    }

    async fn fetch_timestamp(&self) -> Result<Vec<u8>, TransportError> {
        lookup(self.timestamp.as_ref(), || "timestamp.json".to_string())
    }

    async fn fetch_snapshot(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        match version {
            Some(v) => lookup(self.snapshots.get(&v), || format!("{v}.snapshot.json")),
            None => lookup(self.snapshot.as_ref(), || "snapshot.json".to_string()),
        }
    }

    async fn fetch_targets(&self, version: Option<Version>) -> Result<Vec<u8>, TransportError> {
        match version {
            Some(v) => lookup(self.targets_versions.get(&v), || format!("{v}.targets.json")),
            None => lookup(self.targets.as_ref(), || "targets.json".to_string()),
        }
    }

    async fn fetch_target(&self, metapath: &str) -> Result<ByteStream, TransportError> {
        let data = lookup(self.target_files.get(metapath), || metapath.to_string())?;
        let chunks = data
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect::<Vec<_>>();
        Ok(stream::iter(chunks).boxed())
    }
}

/// In-memory implementation for TUF storage. Stores every trusted root and the files for the
/// timestamp, snapshot and targets roles.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    pub roots: BTreeMap<Version, Vec<u8>>,
    pub uncommitted_roots: Vec<(Version, Vec<u8>)>,
    pub timestamp: Option<Vec<u8>>,
    pub snapshot: Option<Vec<u8>>,
    pub targets: Option<Vec<u8>>,
}

impl MemoryStorage {
    /// Creates a storage that trusts `root`. The root is decoded only to learn its version.
    pub fn new(root: &[u8]) -> Result<Self, TufError> {
        let decoded = Signed::<Root>::decode_role(root)?;
        Ok(MemoryStorage {
            roots: BTreeMap::from([(decoded.signed.version, root.to_vec())]),
            ..Default::default()
        })
    }
}

impl TufStorage for MemoryStorage {
    fn delete_timestamp_metadata(&mut self) -> Result<(), TufError> {
        self.timestamp = None;
        Ok(())
    }

    fn delete_snapshot_metadata(&mut self) -> Result<(), TufError> {
        self.snapshot = None;
        Ok(())
    }

    fn persist_root(&mut self, version: Version, data: &[u8]) -> Result<(), TufError> {
        self.uncommitted_roots.push((version, data.to_vec()));
        Ok(())
    }

    fn persist_timestamp(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.timestamp = Some(data.to_vec());
        Ok(())
    }

    fn persist_snapshot(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.snapshot = Some(data.to_vec());
        Ok(())
    }

    fn persist_targets(&mut self, data: &[u8]) -> Result<(), TufError> {
        self.targets = Some(data.to_vec());
        Ok(())
    }

    fn commit_root(&mut self) -> Result<(), TufError> {
        if self.uncommitted_roots.is_empty() {
            return Err(TufError::CouldNotPersistMetadata(
                "no staged root to commit".to_string(),
            ));
        }
        self.roots.extend(self.uncommitted_roots.drain(..));
        Ok(())
    }

    fn discard_uncommitted_roots(&mut self) {
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

#[cfg(test)]
mod test {
    use super::{MemoryStorage, MemoryTransport};
    use core::num::NonZeroU64;
    use tuf_ota_common::remote::{TransportError, TufTransport};
    use tuf_ota_common::storage::TufStorage;

    #[test]
    fn test_memory_storage_commit() {
        let mut storage = MemoryStorage::default();
        storage.roots.insert(1, b"one".to_vec());
        storage.persist_root(2, b"two").unwrap();
        storage.persist_root(3, b"three").unwrap();
        assert_eq!(storage.current_root(), b"one");
        assert_eq!(storage.current_uncommitted_root(), Some(b"three".as_slice()));
        storage.commit_root().unwrap();
        assert_eq!(storage.current_root(), b"three");
        assert_eq!(storage.roots.len(), 3);
        storage.commit_root().expect_err("nothing staged");
    }

    #[test]
    fn test_memory_storage_discard() {
        let mut storage = MemoryStorage::default();
        storage.roots.insert(1, b"one".to_vec());
        storage.persist_root(2, b"two").unwrap();
        storage.discard_uncommitted_roots();
        assert_eq!(storage.current_uncommitted_root(), None);
        assert_eq!(storage.current_root(), b"one");
    }

    #[tokio::test]
    async fn test_memory_transport() {
        let data = vec![7u8; 10_000];
        let transport = MemoryTransport::default()
            .with_root_at(1, b"root".to_vec())
            .with_snapshot(4, b"snapshot-4".to_vec())
            .with_target_file("app-1.0.0.tar.gz", data.clone());

        assert_eq!(
            transport.fetch_root(NonZeroU64::MIN).await.unwrap(),
            b"root"
        );
        assert!(matches!(
            transport.fetch_root(NonZeroU64::MIN.saturating_add(1)).await,
            Err(TransportError::NotFound(_))
        ));
        assert_eq!(transport.fetch_snapshot(None).await.unwrap(), b"snapshot-4");
        assert_eq!(
            transport.fetch_snapshot(Some(4)).await.unwrap(),
            b"snapshot-4"
        );
        transport
            .fetch_snapshot(Some(3))
            .await
            .expect_err("unknown version");
        assert_eq!(
            transport
                .fetch_target_bytes("app-1.0.0.tar.gz", 10_000)
                .await
                .unwrap(),
            data
        );
        assert!(matches!(
            transport.fetch_target_bytes("app-1.0.0.tar.gz", 9_999).await,
            Err(TransportError::TooLarge { .. })
        ));
    }
}

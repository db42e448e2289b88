use super::metadata_name;
use async_trait::async_trait;
use futures::StreamExt;
use path_clean::PathClean;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;
use tuf_ota_common::remote::{ByteStream, TransportError, TufTransport};
use tuf_ota_common::{RoleType, Version};

const CHUNK_SIZE: usize = 8192;

/// Serves a repository from the local filesystem, for example a mounted update medium.
#[derive(Debug, Clone)]
pub struct FilesystemTransport {
    metadata_path: PathBuf,
    targets_path: PathBuf,
}

impl FilesystemTransport {
    pub fn new(metadata_path: PathBuf, targets_path: PathBuf) -> Self {
        FilesystemTransport {
            metadata_path,
            targets_path,
        }
    }

    /// Transport for a repository directory with `metadata/` and `targets/` subdirectories.
    pub fn from_repository_dir(dir: &Path) -> Self {
        Self::new(dir.join("metadata"), dir.join("targets"))
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.metadata_path.join(name);
        debug!("reading {path:?}");
        tokio::fs::read(&path)
            .await
            .map_err(|e| map_io_error(name, e))
    }

    /// Resolves `metapath` below the targets directory, refusing paths that leave it.
    fn target_path(&self, metapath: &str) -> Result<PathBuf, TransportError> {
        let file_path = self.targets_path.join(PathBuf::from(metapath)).clean();
        if !file_path.starts_with(self.targets_path.clean()) {
            return Err(TransportError::NotFound(metapath.to_string()));
        }
        Ok(file_path)
    }
}

fn map_io_error(name: &str, e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::NotFound => TransportError::NotFound(name.to_string()),
        _ => TransportError::Read {
            path: name.to_string(),
            reason: e.to_string(),
        },
    }
}

#[async_trait]
impl TufTransport for FilesystemTransport {
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
        let path = self.target_path(metapath)?;
        debug!("opening {path:?}");
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_io_error(metapath, e))?;
        let name = metapath.to_string();
        let stream = futures::stream::unfold(Some(file), move |file| {
            let name = name.clone();
            async move {
                let mut file = file?;
                let mut buf = vec![0u8; CHUNK_SIZE];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        Some((Ok(buf), Some(file)))
                    }
                    Err(e) => Some((Err(map_io_error(&name, e)), None)),
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod test {
    use super::FilesystemTransport;
    use std::num::NonZeroU64;
    use tuf_ota_common::remote::{TransportError, TufTransport};

    #[tokio::test]
    async fn test_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("metadata")).unwrap();
        std::fs::create_dir_all(dir.path().join("targets/patches")).unwrap();
        std::fs::write(dir.path().join("metadata/1.root.json"), b"root").unwrap();
        std::fs::write(dir.path().join("metadata/3.snapshot.json"), b"snapshot").unwrap();
        let artifact = vec![5u8; 20_000];
        std::fs::write(dir.path().join("targets/patches/app.patch"), &artifact).unwrap();

        let transport = FilesystemTransport::from_repository_dir(dir.path());
        assert_eq!(
            transport.fetch_root(NonZeroU64::MIN).await.unwrap(),
            b"root"
        );
        assert_eq!(
            transport.fetch_snapshot(Some(3)).await.unwrap(),
            b"snapshot"
        );
        assert_eq!(
            transport.fetch_root(NonZeroU64::new(2).unwrap()).await,
            Err(TransportError::NotFound("2.root.json".into()))
        );
        assert_eq!(
            transport
                .fetch_target_bytes("patches/app.patch", 20_000)
                .await
                .unwrap(),
            artifact
        );
        assert!(matches!(
            transport.fetch_target_bytes("patches/app.patch", 100).await,
            Err(TransportError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("targets")).unwrap();
        std::fs::write(dir.path().join("secret"), b"secret").unwrap();
        let transport = FilesystemTransport::from_repository_dir(dir.path());
        assert!(matches!(
            transport.fetch_target("../secret").await,
            Err(TransportError::NotFound(_))
        ));
    }
}

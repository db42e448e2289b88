use crate::error::UpdateError;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tuf_ota_common::remote::{TransportError, TufTransport};
use tuf_ota_json::targets::TargetFile;

/// Receives `(downloaded, total)` byte counts, called from the download task.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Everything a download task needs, owned so that it can move into the spawned task.
pub struct DownloadJob {
    pub transport: Arc<dyn TufTransport>,
    pub metapath: String,
    /// trusted description of the artifact, the download is checked against it
    pub expected: TargetFile,
    pub dir: PathBuf,
    /// timeout for each chunk of the body
    pub chunk_timeout: Duration,
    /// attempts to restart a body that broke off
    pub max_retries: u32,
    pub cancel: Arc<AtomicBool>,
    pub progress: Option<ProgressFn>,
}

/// A downloaded artifact whose length and SHA-256 matched the trusted targets metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFile {
    pub metapath: String,
    pub path: PathBuf,
    pub length: u64,
}

/// Starts the download in its own task.
pub fn spawn(job: DownloadJob) -> JoinHandle<Result<VerifiedFile, UpdateError>> {
    tokio::spawn(job.run())
}

/// Path of the partial download for `metapath` in `dir`.
pub fn part_path(dir: &Path, metapath: &str) -> PathBuf {
    dir.join(format!("{}.part", metapath.replace('/', "_")))
}

impl DownloadJob {
    pub async fn run(self) -> Result<VerifiedFile, UpdateError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(UpdateError::io(&self.dir))?;
        let path = part_path(&self.dir, &self.metapath);
        let result = self.download_with_retries(&path).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove partial download {path:?}: {e}");
                }
            }
        }
        result
    }

    async fn download_with_retries(&self, path: &Path) -> Result<VerifiedFile, UpdateError> {
        // highest reported count, keeps progress monotonic across restarts
        let mut reported = 0u64;
        let mut attempt = 0;
        loop {
            match self.download_once(path, &mut reported).await {
                Err(UpdateError::Transport(e))
                    if e.is_retryable() && attempt < self.max_retries =>
                {
                    attempt += 1;
                    warn!(
                        "download of {} failed: {e}, restarting ({attempt}/{})",
                        self.metapath, self.max_retries
                    );
                }
                result => return result,
            }
        }
    }

    async fn download_once(
        &self,
        path: &Path,
        reported: &mut u64,
    ) -> Result<VerifiedFile, UpdateError> {
        self.check_cancelled()?;
        let total = self.expected.length;
        let expected_hash = self
            .expected
            .sha256()
            .ok_or_else(|| self.integrity_failure("no sha256 hash in targets metadata"))?;
        info!("downloading {} ({total} bytes)", self.metapath);
        let mut stream = self.transport.fetch_target(&self.metapath).await?;
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(UpdateError::io(path))?;
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        loop {
            self.check_cancelled()?;
            let chunk = match tokio::time::timeout(self.chunk_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(TransportError::Timeout(self.metapath.clone()).into()),
            };
            downloaded += chunk.len() as u64;
            if downloaded > total {
                return Err(
                    self.integrity_failure(format!("received more than the declared {total} bytes"))
                );
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(UpdateError::io(path))?;
            if downloaded > *reported {
                *reported = downloaded;
                if let Some(progress) = &self.progress {
                    progress(downloaded, total);
                }
            }
        }
        file.flush().await.map_err(UpdateError::io(path))?;
        file.sync_all().await.map_err(UpdateError::io(path))?;

        debug!("verifying {}", self.metapath);
        if downloaded != total {
            return Err(self.integrity_failure(format!(
                "expected {total} bytes, received {downloaded}"
            )));
        }
        if hasher.finalize().as_slice() != expected_hash {
            return Err(self.integrity_failure("sha256 mismatch"));
        }
        Ok(VerifiedFile {
            metapath: self.metapath.clone(),
            path: path.to_path_buf(),
            length: downloaded,
        })
    }

    fn integrity_failure(&self, reason: impl Into<String>) -> UpdateError {
        UpdateError::IntegrityFailure {
            metapath: self.metapath.clone(),
            reason: reason.into(),
        }
    }

    fn check_cancelled(&self) -> Result<(), UpdateError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }
}

/// Checks bytes that did not come from a download, for example the output of a patch.
pub fn verify_bytes(
    metapath: &str,
    expected: &TargetFile,
    data: &[u8],
) -> Result<(), UpdateError> {
    if data.len() as u64 != expected.length {
        return Err(UpdateError::IntegrityFailure {
            metapath: metapath.to_string(),
            reason: format!("expected {} bytes, got {}", expected.length, data.len()),
        });
    }
    match expected.sha256() {
        Some(hash) if Sha256::digest(data).as_slice() == hash => Ok(()),
        Some(_) => Err(UpdateError::IntegrityFailure {
            metapath: metapath.to_string(),
            reason: "sha256 mismatch".to_string(),
        }),
        None => Err(UpdateError::IntegrityFailure {
            metapath: metapath.to_string(),
            reason: "no sha256 hash in targets metadata".to_string(),
        }),
    }
}

//! [TufTransport] implementations for a remote repository reachable over HTTP(S) or the local
//! filesystem, plus [RetryTransport] which adds timeouts and retries to either of them.
//!
//! Both layouts are the same: a metadata directory with `{N}.root.json`, `timestamp.json`,
//! `snapshot.json`/`{V}.snapshot.json`, `targets.json`/`{V}.targets.json` and a targets
//! directory with the artifacts.
mod fs;
mod http;
mod retry;

pub use fs::FilesystemTransport;
pub use http::HttpTransport;
pub use retry::{RetryPolicy, RetryTransport};

use crate::config::ClientConfig;
use crate::error::UpdateError;
use std::sync::Arc;
use tracing::debug;
use tuf_ota_common::remote::TufTransport;
use tuf_ota_common::{RoleType, Version};

/// File name of a metadata file, prefixed with the version for consistent snapshots.
pub(crate) fn metadata_name(role: RoleType, version: Option<Version>) -> String {
    match version {
        Some(version) => format!("{version}.{}", role.metapath()),
        None => role.metapath(),
    }
}

/// Creates the transport for the configured update URL, wrapped in a [RetryTransport].
pub fn from_config(config: &ClientConfig) -> Result<Arc<dyn TufTransport>, UpdateError> {
    let metadata_url = config.metadata_url()?;
    let targets_url = config.targets_url()?;
    let policy = RetryPolicy::from_config(config);
    debug!("using metadata from {metadata_url}, targets from {targets_url}");
    match metadata_url.scheme() {
        "file" => {
            let to_path = |url: &url::Url| {
                url.to_file_path()
                    .map_err(|_| UpdateError::Config(format!("{url} is not a valid file path")))
            };
            let transport =
                FilesystemTransport::new(to_path(&metadata_url)?, to_path(&targets_url)?);
            Ok(Arc::new(RetryTransport::new(transport, policy)))
        }
        "http" | "https" => {
            let transport = HttpTransport::new(metadata_url, targets_url, config.request_timeout)
                .map_err(|e| UpdateError::Config(e.to_string()))?;
            Ok(Arc::new(RetryTransport::new(transport, policy)))
        }
        scheme => Err(UpdateError::Config(format!(
            "unsupported update url scheme `{scheme}`"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::metadata_name;
    use tuf_ota_common::RoleType;

    #[test]
    fn test_metadata_names() {
        assert_eq!(metadata_name(RoleType::Snapshot, None), "snapshot.json");
        assert_eq!(metadata_name(RoleType::Targets, Some(4)), "4.targets.json");
    }
}

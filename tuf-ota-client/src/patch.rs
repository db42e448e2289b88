//! Incremental updates as zstd dictionary deltas: the archive of the installed version is the
//! dictionary, the patch is the new archive compressed with it.
//!
//! Patches are published as regular targets under `patches/` with a [PatchInfo] in their
//! custom metadata. The output of [apply_patch] is untrusted until it was checked against the
//! targets entry of the full artifact.
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;
use tuf_ota_json::targets::{TargetFile, Targets};

const COMPRESSION_LEVEL: i32 = 3;

/// Custom targets metadata of a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub app: String,
    /// version the patch produces
    pub version: semver::Version,
    /// installed version the patch applies to
    pub patch_from: semver::Version,
}

impl PatchInfo {
    pub fn from_target(target: &TargetFile) -> Option<Self> {
        target
            .custom
            .as_ref()
            .and_then(|custom| serde_json::from_value(custom.clone()).ok())
    }

    pub fn to_custom(&self) -> serde_json::Value {
        serde_json::json!({
            "app": self.app,
            "version": self.version.to_string(),
            "patch_from": self.patch_from.to_string(),
        })
    }
}

/// Target path of the patch from `from` to `to`.
pub fn patch_name(app: &str, from: &semver::Version, to: &semver::Version) -> String {
    format!("patches/{app}-{from}-{to}.patch")
}

/// Looks up a patch from `from` to `to` in the trusted targets.
pub fn find_patch<'t>(
    targets: &'t Targets,
    app: &str,
    from: &semver::Version,
    to: &semver::Version,
) -> Option<(String, &'t TargetFile)> {
    let name = patch_name(app, from, to);
    let target = targets.targets.get(&name)?;
    let info = PatchInfo::from_target(target)?;
    if info.app != app || &info.patch_from != from || &info.version != to {
        debug!("ignoring {name}, custom metadata does not match");
        return None;
    }
    Some((name, target))
}

/// Creates a patch that turns `old` into `new`.
pub fn create_patch(old: &[u8], new: &[u8]) -> std::io::Result<Vec<u8>> {
    let dictionary = zstd::dict::EncoderDictionary::copy(old, COMPRESSION_LEVEL);
    let mut encoder = zstd::Encoder::with_prepared_dictionary(Vec::new(), &dictionary)?;
    encoder.write_all(new)?;
    let patch = encoder.finish()?;
    debug!(
        "created patch of {} bytes for {} byte artifact",
        patch.len(),
        new.len()
    );
    Ok(patch)
}

/// Applies `patch` to `old`, reading at most `limit` bytes of output.
pub fn apply_patch(old: &[u8], patch: &[u8], limit: u64) -> std::io::Result<Vec<u8>> {
    let dictionary = zstd::dict::DecoderDictionary::copy(old);
    let decoder = zstd::Decoder::with_prepared_dictionary(patch, &dictionary)?;
    let mut out = Vec::new();
    decoder.take(limit + 1).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("patch output exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}

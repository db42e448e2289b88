use crate::role::root::TufRoot;
use crate::role::{check_expiry, check_meta_file, DecodeRole};
use chrono::{DateTime, Utc};
use tuf_ota_common::crypto::verify_sha256;
use tuf_ota_common::{RoleType, TufError};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::Snapshot;
use tuf_ota_json::targets::{TargetFile, Targets};
use tuf_ota_json::Signed;

/// Verify a targets file against the pointer in `snapshot` and the trusted targets.
pub fn verify_targets(
    root: &Root,
    snapshot: &Snapshot,
    targets_old: Option<&Signed<Targets>>,
    targets_new: &[u8],
    update_start: &DateTime<Utc>,
) -> Result<Signed<Targets>, TufError> {
    let metapath = RoleType::Targets.metapath();
    let meta = snapshot
        .targets_meta()
        .ok_or(TufError::MissingTargetsFile)?;

    // 5.6.2
    check_meta_file(&metapath, meta, targets_new)?;
    let targets_new = Signed::<Targets>::decode_role(targets_new)?;

    // 5.6.3
    root.verify_role(&targets_new)?;

    // 5.6.4
    if targets_new.signed.version != meta.version {
        return Err(TufError::InvalidNewVersionNumber {
            role: RoleType::Targets,
            expected: meta.version,
            found: targets_new.signed.version,
        });
    }
    if let Some(targets_old) = targets_old {
        if targets_new.signed.version < targets_old.signed.version {
            return Err(TufError::RollbackDetected {
                role: RoleType::Targets,
                trusted: targets_old.signed.version,
                offered: targets_new.signed.version,
            });
        }
    }

    // 5.6.5
    check_expiry(&targets_new.signed, update_start)?;
    Ok(targets_new)
}

/// Looks up the description of `metapath` in `targets`.
pub fn target_description<'t>(
    targets: &'t Targets,
    metapath: &str,
) -> Result<&'t TargetFile, TufError> {
    targets
        .targets
        .get(metapath)
        .ok_or_else(|| TufError::MissingTargetMetadata {
            metapath: metapath.to_string(),
        })
}

/// Verify a downloaded target file against its description in trusted targets metadata.
pub fn verify_target_file(
    targets: &Targets,
    metapath: &str,
    target_file: &[u8],
) -> Result<(), TufError> {
    // 5.7.1 Verify the desired target against its targets metadata.
    let description = target_description(targets, metapath)?;
    if description.length != target_file.len() as u64 {
        return Err(TufError::InvalidLength {
            metapath: metapath.to_string(),
            expected: description.length,
            actual: target_file.len() as u64,
        });
    }
    let expected_hash = description
        .sha256()
        .ok_or_else(|| TufError::NoSupportedHash {
            metapath: metapath.to_string(),
        })?;
    if !verify_sha256(expected_hash, target_file) {
        return Err(TufError::InvalidHash {
            metapath: metapath.to_string(),
        });
    }
    Ok(())
}

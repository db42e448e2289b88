pub mod root;
pub mod snapshot;
pub mod targets;
pub mod timestamp;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tuf_ota_common::crypto::verify_sha256;
use tuf_ota_common::{RoleType, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::{MetaFile, Snapshot};
use tuf_ota_json::targets::Targets;
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::Signed;

/// Trait for easy access to a constant that specifies the role, and the fields every role has.
pub trait TufRole: Serialize + DeserializeOwned {
    const TYPE: RoleType;

    fn version(&self) -> Version;
    fn expires(&self) -> DateTime<Utc>;
}

/// Trait to abstract the decoding of a TUF role.
pub trait DecodeRole: Sized {
    fn decode_role(input: &[u8]) -> Result<Self, TufError>;
}

impl<T: TufRole> DecodeRole for Signed<T> {
    fn decode_role(input: &[u8]) -> Result<Self, TufError> {
        Signed::from_json(input, T::TYPE)
    }
}

macro_rules! impl_tuf_role {
    ($ty:ty, $role:expr) => {
        impl TufRole for $ty {
            const TYPE: RoleType = $role;

            fn version(&self) -> Version {
                self.version
            }

            fn expires(&self) -> DateTime<Utc> {
                self.expires
            }
        }
    };
}

impl_tuf_role!(Root, RoleType::Root);
impl_tuf_role!(Timestamp, RoleType::Timestamp);
impl_tuf_role!(Snapshot, RoleType::Snapshot);
impl_tuf_role!(Targets, RoleType::Targets);

/// Rejects metadata whose expiration lies before the start of the update.
pub fn check_expiry<T: TufRole>(role: &T, update_start: &DateTime<Utc>) -> Result<(), TufError> {
    if &role.expires() < update_start {
        return Err(TufError::ExpiredMetadata {
            role: T::TYPE,
            expires: role.expires(),
        });
    }
    Ok(())
}

/// Compares a downloaded metadata file with the pointer that references it, length first.
pub(crate) fn check_meta_file(
    metapath: &str,
    meta: &MetaFile,
    data: &[u8],
) -> Result<(), TufError> {
    if meta.length != data.len() as u64 {
        return Err(TufError::InvalidLength {
            metapath: metapath.to_string(),
            expected: meta.length,
            actual: data.len() as u64,
        });
    }
    let expected = meta.sha256().ok_or_else(|| TufError::NoSupportedHash {
        metapath: metapath.to_string(),
    })?;
    if !verify_sha256(expected, data) {
        return Err(TufError::InvalidHash {
            metapath: metapath.to_string(),
        });
    }
    Ok(())
}

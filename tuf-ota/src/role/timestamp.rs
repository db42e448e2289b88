use crate::role::root::TufRoot;
use crate::role::{check_expiry, DecodeRole};
use chrono::{DateTime, Utc};
use tuf_ota_common::{RoleType, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::Signed;

/// Outcome of checking a freshly downloaded timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampUpdate {
    /// The remote offered a newer timestamp.
    New(Signed<Timestamp>),
    /// The remote offered the version that is already trusted, the trusted file stays.
    Unchanged,
}

/// Verify a new timestamp against the current root and the trusted timestamp and snapshot.
pub fn verify_timestamp(
    root: &Root,
    timestamp_old: Option<&Signed<Timestamp>>,
    trusted_snapshot_version: Option<Version>,
    timestamp_new: &[u8],
    update_start: &DateTime<Utc>,
) -> Result<TimestampUpdate, TufError> {
    let timestamp_new = Signed::<Timestamp>::decode_role(timestamp_new)?;

    // 5.4.2
    root.verify_role(&timestamp_new)?;

    let snapshot_meta = timestamp_new
        .signed
        .snapshot_meta()
        .ok_or(TufError::MissingSnapshotFile)?;

    // 5.4.3 check for a rollback attack
    if let Some(timestamp_old) = timestamp_old {
        if timestamp_new.signed.version < timestamp_old.signed.version {
            return Err(TufError::RollbackDetected {
                role: RoleType::Timestamp,
                trusted: timestamp_old.signed.version,
                offered: timestamp_new.signed.version,
            });
        }
        if let Some(old_meta) = timestamp_old.signed.snapshot_meta() {
            if snapshot_meta.version < old_meta.version {
                return Err(TufError::RollbackDetected {
                    role: RoleType::Snapshot,
                    trusted: old_meta.version,
                    offered: snapshot_meta.version,
                });
            }
        }
        // From the TUF spec: 'In case [the version numbers] are equal,
        // discard the new timestamp metadata and abort the update cycle.
        // This is normal and it shouldn't raise any error.'
        if timestamp_new.signed.version == timestamp_old.signed.version {
            check_expiry(&timestamp_old.signed, update_start)?;
            return Ok(TimestampUpdate::Unchanged);
        }
    }
    if let Some(trusted) = trusted_snapshot_version {
        if snapshot_meta.version < trusted {
            return Err(TufError::RollbackDetected {
                role: RoleType::Snapshot,
                trusted,
                offered: snapshot_meta.version,
            });
        }
    }

    // 5.4.5 freeze attack
    check_expiry(&timestamp_new.signed, update_start)?;
    Ok(TimestampUpdate::New(timestamp_new))
}

#[cfg(test)]
mod test {
    use super::{verify_timestamp, TimestampUpdate};
    use crate::builder::{RootBuilder, TimestampBuilder};
    use chrono::{TimeZone, Utc};
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::{RoleType, TufError};
    use tuf_ota_json::root::Root;
    use tuf_ota_json::timestamp::Timestamp;
    use tuf_ota_json::{Key, Signed};

    struct Fixture {
        root: Root,
        timestamp_key: SigningKey,
    }

    fn fixture() -> Fixture {
        let root_key = SigningKey::new(Cipher::Ed25519Dalek);
        let timestamp_key = SigningKey::new(Cipher::Ed25519Dalek);
        let root = RootBuilder::default()
            .with_version(1)
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_role_and_key(RoleType::Root, &[Key::from_signing_key(&root_key).unwrap()], 1)
            .unwrap()
            .with_role_and_key(
                RoleType::Timestamp,
                &[Key::from_signing_key(&timestamp_key).unwrap()],
                1,
            )
            .unwrap()
            .build()
            .unwrap();
        Fixture {
            root,
            timestamp_key,
        }
    }

    fn timestamp(key: &SigningKey, version: u32, snapshot_version: u32) -> Signed<Timestamp> {
        let body = TimestampBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .with_snapshot(b"snapshot", snapshot_version)
            .build();
        Signed::from_signed(body, &[key.clone()]).unwrap()
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_verify_timestamp() {
        let f = fixture();
        let new = timestamp(&f.timestamp_key, 2, 2);
        let old = timestamp(&f.timestamp_key, 1, 1);

        // Case: valid, no trusted timestamp
        let update = verify_timestamp(&f.root, None, None, &new.to_json().unwrap(), &now())
            .expect("failed to verify timestamp");
        assert_eq!(update, TimestampUpdate::New(new.clone()));

        // Case: valid, newer than trusted
        verify_timestamp(&f.root, Some(&old), Some(1), &new.to_json().unwrap(), &now())
            .expect("failed to verify timestamp");

        // Case: expired
        let later = Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap();
        verify_timestamp(&f.root, None, None, &new.to_json().unwrap(), &later)
            .expect_err("accepted expired timestamp");
    }

    #[test]
    fn test_verify_timestamp_rollback() {
        let f = fixture();
        let old = timestamp(&f.timestamp_key, 5, 5);
        let new = timestamp(&f.timestamp_key, 4, 5);
        let err = verify_timestamp(&f.root, Some(&old), Some(5), &new.to_json().unwrap(), &now())
            .expect_err("accepted rolled back timestamp");
        assert_eq!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Timestamp,
                trusted: 5,
                offered: 4
            }
        );
    }

    /// Tests if a timestamp pointing at an older snapshot than the trusted one is rejected.
    #[test]
    fn test_verify_timestamp_snapshot_rollback() {
        let f = fixture();
        let new = timestamp(&f.timestamp_key, 6, 3);
        let err = verify_timestamp(&f.root, None, Some(4), &new.to_json().unwrap(), &now())
            .expect_err("accepted snapshot rollback");
        assert!(matches!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Snapshot,
                ..
            }
        ));

        let old = timestamp(&f.timestamp_key, 5, 4);
        verify_timestamp(&f.root, Some(&old), None, &new.to_json().unwrap(), &now())
            .expect_err("accepted snapshot rollback");
    }

    #[test]
    fn test_verify_timestamp_equal_version_keeps_trusted() {
        let f = fixture();
        let old = timestamp(&f.timestamp_key, 3, 3);
        let update =
            verify_timestamp(&f.root, Some(&old), Some(3), &old.to_json().unwrap(), &now())
                .unwrap();
        assert_eq!(update, TimestampUpdate::Unchanged);
    }

    #[test]
    fn test_verify_timestamp_wrong_key() {
        let f = fixture();
        let other = SigningKey::new(Cipher::Ed25519Dalek);
        let new = timestamp(&other, 2, 2);
        let err = verify_timestamp(&f.root, None, None, &new.to_json().unwrap(), &now())
            .expect_err("accepted timestamp signed by unknown key");
        assert!(matches!(err, TufError::InsufficientSignatures { .. }));
    }
}

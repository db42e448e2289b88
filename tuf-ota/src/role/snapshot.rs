use crate::role::root::TufRoot;
use crate::role::{check_expiry, check_meta_file, DecodeRole};
use chrono::{DateTime, Utc};
use tuf_ota_common::{RoleType, TufError};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::Snapshot;
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::Signed;

/// Verify a snapshot file against the pointer in `timestamp` and the trusted snapshot.
pub fn verify_snapshot(
    root: &Root,
    timestamp: &Timestamp,
    snapshot_old: Option<&Signed<Snapshot>>,
    snapshot_new: &[u8],
    update_start: &DateTime<Utc>,
) -> Result<Signed<Snapshot>, TufError> {
    let metapath = RoleType::Snapshot.metapath();
    let meta = timestamp
        .snapshot_meta()
        .ok_or(TufError::MissingSnapshotFile)?;

    // 5.5.2
    check_meta_file(&metapath, meta, snapshot_new)?;
    let snapshot_new = Signed::<Snapshot>::decode_role(snapshot_new)?;

    // 5.5.3
    root.verify_role(&snapshot_new)?;

    // 5.5.4
    if snapshot_new.signed.version != meta.version {
        return Err(TufError::InvalidNewVersionNumber {
            role: RoleType::Snapshot,
            expected: meta.version,
            found: snapshot_new.signed.version,
        });
    }

    if let Some(snapshot_old) = snapshot_old {
        if snapshot_new.signed.version < snapshot_old.signed.version {
            return Err(TufError::RollbackDetected {
                role: RoleType::Snapshot,
                trusted: snapshot_old.signed.version,
                offered: snapshot_new.signed.version,
            });
        }
        // 5.5.5 Ensure every targets metadata file still exists
        //       and the old version numbers are less or equal to the new one.
        for (path, old) in snapshot_old.signed.meta.iter() {
            let offered = snapshot_new
                .signed
                .meta
                .get(path)
                .map(|new| new.version)
                .unwrap_or(0);
            if offered < old.version {
                return Err(TufError::RollbackDetected {
                    role: RoleType::Targets,
                    trusted: old.version,
                    offered,
                });
            }
        }
    }

    // 5.5.6
    check_expiry(&snapshot_new.signed, update_start)?;
    Ok(snapshot_new)
}

#[cfg(test)]
mod test {
    use super::verify_snapshot;
    use crate::builder::{RootBuilder, SnapshotBuilder, TargetsBuilder, TimestampBuilder};
    use chrono::{TimeZone, Utc};
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::{RoleType, TufError};
    use tuf_ota_json::root::Root;
    use tuf_ota_json::snapshot::Snapshot;
    use tuf_ota_json::timestamp::Timestamp;
    use tuf_ota_json::{Key, Signed};

    struct Fixture {
        root: Root,
        snapshot_key: SigningKey,
        targets_key: SigningKey,
    }

    fn fixture() -> Fixture {
        let root_key = SigningKey::new(Cipher::Ed25519Dalek);
        let snapshot_key = SigningKey::new(Cipher::Ed25519Dalek);
        let targets_key = SigningKey::new(Cipher::Ecdsa);
        let key = |k: &SigningKey| vec![Key::from_signing_key(k).unwrap()];
        let root = RootBuilder::default()
            .with_role_and_key(RoleType::Root, &key(&root_key), 1)
            .unwrap()
            .with_role_and_key(RoleType::Snapshot, &key(&snapshot_key), 1)
            .unwrap()
            .with_role_and_key(RoleType::Targets, &key(&targets_key), 1)
            .unwrap()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(1)
            .build()
            .unwrap();
        Fixture {
            root,
            snapshot_key,
            targets_key,
        }
    }

    fn snapshot(f: &Fixture, version: u32, targets_version: u32) -> Signed<Snapshot> {
        let targets = TargetsBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(targets_version)
            .build();
        let signed_targets = Signed::from_signed(targets, &[f.targets_key.clone()]).unwrap();
        let body = SnapshotBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .with_meta("targets.json", &signed_targets.to_json().unwrap(), targets_version)
            .build();
        Signed::from_signed(body, &[f.snapshot_key.clone()]).unwrap()
    }

    fn timestamp_for(snapshot: &Signed<Snapshot>) -> Timestamp {
        TimestampBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(1)
            .with_snapshot(&snapshot.to_json().unwrap(), snapshot.signed.version)
            .build()
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_verify_snapshot() {
        let f = fixture();
        let signed_snapshot = snapshot(&f, 1, 1);
        let timestamp = timestamp_for(&signed_snapshot);
        let encoded = signed_snapshot.to_json().unwrap();

        // Case: valid
        verify_snapshot(&f.root, &timestamp, None, &encoded, &now())
            .expect("failed to verify valid snapshot file");

        // Case: expired
        let later = Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap();
        verify_snapshot(&f.root, &timestamp, None, &encoded, &later)
            .expect_err("accepted expired snapshot");
    }

    /// Tests if flipping a single byte is detected by the hash check.
    #[test]
    fn test_verify_snapshot_single_byte_corruption() {
        let f = fixture();
        let signed_snapshot = snapshot(&f, 1, 1);
        let timestamp = timestamp_for(&signed_snapshot);
        let mut encoded = signed_snapshot.to_json().unwrap();
        let position = encoded.iter().position(|b| *b == b'1').unwrap();
        encoded[position] = b'2';
        let err = verify_snapshot(&f.root, &timestamp, None, &encoded, &now())
            .expect_err("accepted corrupted snapshot");
        assert_eq!(
            err,
            TufError::InvalidHash {
                metapath: "snapshot.json".to_string()
            }
        );
    }

    #[test]
    fn test_verify_snapshot_length() {
        let f = fixture();
        let signed_snapshot = snapshot(&f, 1, 1);
        let timestamp = timestamp_for(&signed_snapshot);
        let mut encoded = signed_snapshot.to_json().unwrap();
        encoded.push(b' ');
        let err = verify_snapshot(&f.root, &timestamp, None, &encoded, &now())
            .expect_err("accepted snapshot of wrong length");
        assert!(matches!(err, TufError::InvalidLength { .. }));
    }

    /// Tests if a snapshot that lowers the targets version is rejected.
    #[test]
    fn test_verify_snapshot_targets_rollback() {
        let f = fixture();
        let old = snapshot(&f, 1, 3);
        let new = snapshot(&f, 2, 2);
        let timestamp = timestamp_for(&new);
        let err = verify_snapshot(
            &f.root,
            &timestamp,
            Some(&old),
            &new.to_json().unwrap(),
            &now(),
        )
        .expect_err("accepted targets rollback");
        assert_eq!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Targets,
                trusted: 3,
                offered: 2
            }
        );
    }

    #[test]
    fn test_verify_snapshot_rollback() {
        let f = fixture();
        let old = snapshot(&f, 4, 1);
        let new = snapshot(&f, 3, 1);
        let timestamp = timestamp_for(&new);
        let err = verify_snapshot(
            &f.root,
            &timestamp,
            Some(&old),
            &new.to_json().unwrap(),
            &now(),
        )
        .expect_err("accepted snapshot rollback");
        assert!(matches!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Snapshot,
                ..
            }
        ));
    }

    #[test]
    fn test_verify_snapshot_version_mismatch() {
        let f = fixture();
        let new = snapshot(&f, 2, 1);
        let encoded = new.to_json().unwrap();
        let timestamp = TimestampBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(1)
            .with_snapshot(&encoded, 3)
            .build();
        let err = verify_snapshot(&f.root, &timestamp, None, &encoded, &now())
            .expect_err("accepted snapshot with unexpected version");
        assert!(matches!(err, TufError::InvalidNewVersionNumber { .. }));
    }
}

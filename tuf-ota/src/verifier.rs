use crate::role::root::TufRoot;
use crate::role::{check_expiry, TufRole};
use chrono::{DateTime, Utc};
use tuf_ota_common::{RoleType, Threshold, TufError};
use tuf_ota_json::root::Root;
use tuf_ota_json::Signed;

/// Outcome of counting the signatures of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReport {
    pub role: RoleType,
    /// Distinct authorized keys with a valid signature.
    pub valid: usize,
    pub threshold: Threshold,
    /// Signatures from authorized keys that were malformed or did not verify.
    pub rejected: Vec<TufError>,
}

impl SignatureReport {
    pub fn threshold_reached(&self) -> bool {
        self.valid >= self.threshold as usize
    }
}

/// Checks a document against the keys that `trusted_root` assigns to its role and against the
/// clock `update_start`. Does not look at versions, those depend on previously trusted state.
pub fn verify<T: TufRole>(
    document: &Signed<T>,
    trusted_root: &Root,
    update_start: &DateTime<Utc>,
) -> Result<SignatureReport, TufError> {
    let report = trusted_root.verify_role(document)?;
    check_expiry(&document.signed, update_start)?;
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::verify;
    use crate::builder::{RootBuilder, TimestampBuilder};
    use chrono::{TimeZone, Utc};
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::{RoleType, TufError};
    use tuf_ota_json::root::Root;
    use tuf_ota_json::timestamp::Timestamp;
    use tuf_ota_json::{Key, Signature, Signed};

    fn root_with_timestamp_keys(keys: &[SigningKey], threshold: u8) -> Root {
        let root_key = SigningKey::new(Cipher::Ed25519Dalek);
        let public = keys
            .iter()
            .map(|k| Key::from_signing_key(k).unwrap())
            .collect::<Vec<_>>();
        RootBuilder::default()
            .with_role_and_key(
                RoleType::Root,
                &[Key::from_signing_key(&root_key).unwrap()],
                1,
            )
            .unwrap()
            .with_role_and_key(RoleType::Timestamp, &public, threshold)
            .unwrap()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(1)
            .build()
            .unwrap()
    }

    fn timestamp() -> Timestamp {
        TimestampBuilder::default()
            .with_version(1)
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_snapshot(b"snapshot", 1)
            .build()
    }

    #[test]
    fn test_verify_valid() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let k2 = SigningKey::new(Cipher::Ecdsa);
        let root = root_with_timestamp_keys(&[k1.clone(), k2.clone()], 2);
        let signed = Signed::from_signed(timestamp(), &[k1, k2]).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let report = verify(&signed, &root, &now).expect("failed to verify");
        assert_eq!(report.valid, 2);
        assert!(report.rejected.is_empty());
    }

    /// Tests if a key that signs twice is only counted once.
    #[test]
    fn test_verify_duplicate_key_counted_once() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let k2 = SigningKey::new(Cipher::Ed25519Dalek);
        let root = root_with_timestamp_keys(&[k1.clone(), k2], 2);
        let signed = Signed::from_signed(timestamp(), &[k1.clone(), k1]).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = verify(&signed, &root, &now).expect_err("expected failure");
        assert_eq!(
            err,
            TufError::InsufficientSignatures {
                role: RoleType::Timestamp,
                valid: 1,
                threshold: 2
            }
        );
    }

    /// Tests if malformed signatures only reduce the count.
    #[test]
    fn test_verify_bad_signature_is_reported() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let k2 = SigningKey::new(Cipher::Ed25519Dalek);
        let root = root_with_timestamp_keys(&[k1.clone(), k2.clone()], 1);
        let mut signed = Signed::from_signed(timestamp(), &[k1, k2]).unwrap();
        signed.signatures[0].sig = "zz".to_string();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let report = verify(&signed, &root, &now).expect("one valid signature is enough");
        assert_eq!(report.valid, 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(report.rejected[0], TufError::BadSignature { .. }));
    }

    #[test]
    fn test_verify_unknown_keys_ignored() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let stranger = SigningKey::new(Cipher::Ed25519Dalek);
        let root = root_with_timestamp_keys(&[k1], 1);
        let mut signed = Signed::from_signed(timestamp(), &[stranger]).unwrap();
        signed.signatures.push(Signature {
            keyid: "not a key id".to_string(),
            sig: "00".to_string(),
        });
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = verify(&signed, &root, &now).expect_err("expected failure");
        assert!(matches!(err, TufError::InsufficientSignatures { valid: 0, .. }));
    }

    #[test]
    fn test_verify_expired() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let root = root_with_timestamp_keys(&[k1.clone()], 1);
        let signed = Signed::from_signed(timestamp(), &[k1]).unwrap();
        let now = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        let err = verify(&signed, &root, &now).expect_err("expected failure");
        assert!(matches!(
            err,
            TufError::ExpiredMetadata {
                role: RoleType::Timestamp,
                ..
            }
        ));
    }

    #[test]
    fn test_verify_missing_role() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let root = root_with_timestamp_keys(&[k1.clone()], 1);
        let snapshot = crate::builder::SnapshotBuilder::default()
            .with_version(1)
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .build();
        let signed = Signed::from_signed(snapshot, &[k1]).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err = verify(&signed, &root, &now).expect_err("expected failure");
        assert_eq!(err, TufError::MissingRoleKeys(RoleType::Snapshot));
    }

    /// Tests if a role without a reachable threshold verifies nothing, not even unsigned documents.
    #[test]
    fn test_verify_invalid_threshold() {
        let k1 = SigningKey::new(Cipher::Ed25519Dalek);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut root = root_with_timestamp_keys(&[k1.clone()], 1);
        root.roles.get_mut(&RoleType::Timestamp).unwrap().threshold = 0;

        let unsigned = Signed::from_signed(timestamp(), &[]).unwrap();
        let err = verify(&unsigned, &root, &now).expect_err("accepted unsigned timestamp");
        assert_eq!(
            err,
            TufError::InvalidRoleThreshold {
                role: RoleType::Timestamp
            }
        );

        let mut root = root_with_timestamp_keys(&[k1.clone()], 1);
        root.roles.get_mut(&RoleType::Timestamp).unwrap().threshold = 2;
        let signed = Signed::from_signed(timestamp(), &[k1]).unwrap();
        let err = verify(&signed, &root, &now).expect_err("accepted unreachable threshold");
        assert_eq!(
            err,
            TufError::InvalidRoleThreshold {
                role: RoleType::Timestamp
            }
        );
    }
}

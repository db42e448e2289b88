use crate::role::{check_expiry, DecodeRole, TufRole};
use crate::verifier::SignatureReport;
use chrono::{DateTime, Utc};
use core::num::NonZeroU64;
use std::collections::BTreeMap;
use tracing::{debug, info};
use tuf_ota_common::remote::{TransportError, TufTransport};
use tuf_ota_common::{RoleType, Threshold, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::{Key, KeyId, Signed};

/// A trait that represents all the operations that can be done with a root file on the client side.
pub trait TufRoot {
    /// Extract the signing threshold for the given role.
    fn role_threshold(&self, role: RoleType) -> Result<Threshold, TufError>;

    /// Return the keys for a given role.
    fn role_keys(&self, role: RoleType) -> Result<BTreeMap<KeyId, &Key>, TufError>;

    /// Count the valid signatures on `document` made by keys this root assigns to `role`.
    fn count_signatures<T>(
        &self,
        role: RoleType,
        document: &Signed<T>,
    ) -> Result<SignatureReport, TufError> {
        let msg = document.canonical_signed();
        let threshold = self.role_threshold(role)?;
        let mut role_keys = self.role_keys(role)?;
        if threshold == 0 || role_keys.len() < threshold as usize {
            return Err(TufError::InvalidRoleThreshold { role });
        }
        let mut valid = 0;
        let mut rejected = Vec::new();

        for sig in document.signatures.iter() {
            let Some(key_id) = sig.key_id() else {
                rejected.push(TufError::BadSignature {
                    key_id: sig.keyid.clone(),
                });
                continue;
            };
            // Keys of other roles and keys that already counted are skipped.
            let Some(key) = role_keys.get(&key_id) else {
                continue;
            };
            let verified = sig
                .raw_sig()
                .ok_or(TufError::DecodingSignatureFailed)
                .and_then(|raw| key.verify(msg, &raw));
            match verified {
                Ok(()) => {
                    // Using remove ensures each key is only used to create a single signature.
                    role_keys.remove(&key_id);
                    valid += 1;
                }
                Err(err) => {
                    debug!("rejected signature of {key_id} on {role} metadata: {err}");
                    rejected.push(TufError::BadSignature {
                        key_id: key_id.to_string(),
                    });
                }
            }
        }

        Ok(SignatureReport {
            role,
            valid,
            threshold,
            rejected,
        })
    }

    /// Verify that the role was signed by the root.
    fn verify_role<T: TufRole>(&self, role: &Signed<T>) -> Result<SignatureReport, TufError> {
        let report = self.count_signatures(T::TYPE, role)?;
        if !report.threshold_reached() {
            return Err(TufError::InsufficientSignatures {
                role: T::TYPE,
                valid: report.valid,
                threshold: report.threshold,
            });
        }
        Ok(report)
    }

    /// Verify that the other root is signed by the threshold of root keys of this root.
    fn verify_root(&self, other: &Signed<Root>) -> Result<SignatureReport, TufError> {
        self.verify_role(other)
    }
}

/// Every role of `root` needs a threshold of at least one that its distinct keys can reach.
pub fn check_role_thresholds(root: &Root) -> Result<(), TufError> {
    for role in root.roles.keys() {
        let threshold = TufRoot::role_threshold(root, *role)?;
        let keys = TufRoot::role_keys(root, *role)?;
        if threshold == 0 || keys.len() < threshold as usize {
            return Err(TufError::InvalidRoleThreshold { role: *role });
        }
    }
    Ok(())
}

impl TufRoot for Root {
    fn role_threshold(&self, role: RoleType) -> Result<Threshold, TufError> {
        Root::role_threshold(self, role).ok_or(TufError::MissingRoleKeys(role))
    }

    fn role_keys(&self, role: RoleType) -> Result<BTreeMap<KeyId, &Key>, TufError> {
        Root::role_keys(self, role).ok_or(TufError::MissingRoleKeys(role))
    }
}

/// Verify that the new root is valid given the old root. Returns the new root if successful.
pub(crate) fn update_root_step(
    old_root: &Signed<Root>,
    next_root: Signed<Root>,
) -> Result<Signed<Root>, TufError> {
    check_role_thresholds(&next_root.signed)?;
    // 5.3.4 signed by the threshold of the trusted root and by itself
    old_root.signed.verify_root(&next_root)?;
    next_root.signed.verify_role(&next_root)?;
    // 5.3.5 check for a rollback attack
    let expected = old_root.signed.version.saturating_add(1);
    let found = next_root.signed.version;
    if found < expected {
        return Err(TufError::RollbackDetected {
            role: RoleType::Root,
            trusted: old_root.signed.version,
            offered: found,
        });
    }
    if found != expected {
        return Err(TufError::InvalidNewVersionNumber {
            role: RoleType::Root,
            expected,
            found,
        });
    }
    Ok(next_root)
}

/// Result of walking the root chain.
#[derive(Debug, Clone)]
pub struct RootUpdate {
    /// The newest verified root, the trusted one if there was no newer one.
    pub root: Signed<Root>,
    /// Every newly accepted root with its encoding, in version order.
    pub chain: Vec<(Version, Vec<u8>)>,
    /// The timestamp keys changed and the trusted timestamp has to be discarded.
    pub delete_timestamp: bool,
    /// The snapshot keys changed and the trusted snapshot has to be discarded.
    pub delete_snapshot: bool,
}

/// Any added or revoked key, or a changed threshold, counts as a rotation.
fn keys_rotated(old: &Root, new: &Root, role: RoleType) -> Result<bool, TufError> {
    let Ok(old_keys) = TufRoot::role_keys(old, role) else {
        return Ok(false);
    };
    let new_keys = TufRoot::role_keys(new, role)?;
    Ok(old_keys.keys().ne(new_keys.keys())
        || TufRoot::role_threshold(old, role)? != TufRoot::role_threshold(new, role)?)
}

/// Refer to the [TUF specification section on updating the root role](https://theupdateframework.github.io/specification/latest/#update-root) for more information.
///
/// Walks from `trusted` to the newest root that the remote offers. Nothing is stored here,
/// the caller persists [RootUpdate::chain] once the rest of the refresh succeeded.
pub async fn update_root<T>(
    remote: &T,
    trusted: &Signed<Root>,
    max_rotations: u32,
    update_start: &DateTime<Utc>,
) -> Result<RootUpdate, TufError>
where
    T: TufTransport + ?Sized,
{
    let mut current = trusted.clone();
    let mut chain = Vec::new();
    loop {
        let next_version = NonZeroU64::MIN.saturating_add(current.signed.version as u64);
        let data = match remote.fetch_root(next_version).await {
            Ok(data) => data,
            Err(TransportError::NotFound(_)) => break,
            Err(err) => return Err(err.into()),
        };
        let offered = Signed::<Root>::decode_role(&data)?;
        if offered.signed.version == current.signed.version {
            debug!(
                "remote answered {next_version}.root.json with version {}",
                current.signed.version
            );
            break;
        }
        if chain.len() as u32 >= max_rotations {
            return Err(TufError::TooManyRootRotations { max: max_rotations });
        }
        let next = update_root_step(&current, offered)?;
        info!(
            "accepted root version {} (previous {})",
            next.signed.version, current.signed.version
        );
        chain.push((next.signed.version, data));
        current = next;
    }

    // 5.3.10 freeze attack
    check_expiry(&current.signed, update_start)?;

    // delete timestamp or snapshot metadata when keys are rotated (5.3.11)
    let delete_timestamp = keys_rotated(&trusted.signed, &current.signed, RoleType::Timestamp)?;
    let delete_snapshot = keys_rotated(&trusted.signed, &current.signed, RoleType::Snapshot)?;

    Ok(RootUpdate {
        root: current,
        chain,
        delete_timestamp,
        delete_snapshot,
    })
}

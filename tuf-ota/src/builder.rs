use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tuf_ota_common::{RoleType, Threshold, TufError, Version};
use tuf_ota_json::root::{Role, Root};
use tuf_ota_json::snapshot::{MetaFile, Snapshot};
use tuf_ota_json::targets::{TargetFile, Targets};
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::{Key, SPEC_VERSION};

/// Invalid calendar dates are mapped to the epoch, which makes the metadata expired.
fn utc(year: i32, month: u32, day: u32, hour: u32, minutes: u32, seconds: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minutes, seconds)
        .single()
        .unwrap_or_default()
}

pub struct RootBuilder {
    root: Root,
}

impl Default for RootBuilder {
    fn default() -> Self {
        RootBuilder {
            root: Root {
                spec_version: SPEC_VERSION.to_string(),
                consistent_snapshot: true,
                version: 0,
                expires: DateTime::<Utc>::default(),
                keys: Default::default(),
                roles: Default::default(),
            },
        }
    }
}

impl RootBuilder {
    /// Starts from an existing root, e.g. to create its successor.
    pub fn from_root(root: Root) -> Self {
        RootBuilder { root }
    }

    /// Set the expiration date of the root role to this [UTC date](https://en.wikipedia.org/wiki/Coordinated_Universal_Time).
    pub fn with_expiration_utc(
        self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minutes: u32,
        seconds: u32,
    ) -> Self {
        self.with_expires(utc(year, month, day, hour, minutes, seconds))
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.root.expires = expires;
        self
    }

    /// Add a key to the root file.
    pub fn with_key(mut self, key: Key) -> Result<Self, TufError> {
        self.root.keys.insert(key.key_id()?, key);
        Ok(self)
    }

    /// Set the keys of a role, replacing the previous assignment of that role.
    /// Keys that no role references anymore are removed.
    pub fn with_role_and_key(
        mut self,
        role: RoleType,
        keys: &[Key],
        threshold: Threshold,
    ) -> Result<Self, TufError> {
        let keyids = keys.iter().map(Key::key_id).collect::<Result<Vec<_>, _>>()?;
        self.root.roles.insert(role, Role { keyids, threshold });
        let builder = keys
            .iter()
            .cloned()
            .try_fold(self, |builder, key| builder.with_key(key))?;
        Ok(builder.prune_keys())
    }

    fn prune_keys(mut self) -> Self {
        let roles = &self.root.roles;
        self.root
            .keys
            .retain(|key_id, _| roles.values().any(|role| role.keyids.contains(key_id)));
        self
    }

    /// Set the version of the root file.
    pub fn with_version(mut self, version: Version) -> Self {
        self.root.version = version;
        self
    }

    /// Set the flag whether [consistent snapshots](https://theupdateframework.github.io/specification/latest/#consistent-snapshots) are enabled.
    pub fn consistent_snapshot(mut self, consistent_snapshots: bool) -> Self {
        self.root.consistent_snapshot = consistent_snapshots;
        self
    }

    /// Return the constructed root file. Every role needs a threshold of at least one that its keys can reach.
    pub fn build(self) -> Result<Root, TufError> {
        for (role, assignment) in self.root.roles.iter() {
            let distinct = assignment
                .keyids
                .iter()
                .filter(|id| self.root.keys.contains_key(id))
                .collect::<std::collections::BTreeSet<_>>()
                .len();
            if assignment.threshold == 0 || distinct < assignment.threshold as usize {
                return Err(TufError::InvalidRoleThreshold { role: *role });
            }
        }
        Ok(self.root)
    }
}

pub struct TimestampBuilder {
    inner: Timestamp,
}

impl Default for TimestampBuilder {
    fn default() -> Self {
        TimestampBuilder {
            inner: Timestamp {
                spec_version: SPEC_VERSION.to_string(),
                version: 0,
                expires: DateTime::<Utc>::default(),
                meta: Default::default(),
            },
        }
    }
}

impl TimestampBuilder {
    /// Point the timestamp at the given encoded snapshot file.
    pub fn with_snapshot(mut self, snapshot: &[u8], version: Version) -> Self {
        self.inner.meta = BTreeMap::from([(
            RoleType::Snapshot.metapath(),
            MetaFile::for_file(version, snapshot),
        )]);
        self
    }

    /// Set the expiration date of the timestamp role to this [UTC date](https://en.wikipedia.org/wiki/Coordinated_Universal_Time).
    pub fn with_expiration_utc(
        self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minutes: u32,
        seconds: u32,
    ) -> Self {
        self.with_expires(utc(year, month, day, hour, minutes, seconds))
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.inner.expires = expires;
        self
    }

    /// Set the version of the timestamp file. Has to increase between iterations.
    pub fn with_version(mut self, version: Version) -> Self {
        self.inner.version = version;
        self
    }

    /// Finish the construction.
    pub fn build(self) -> Timestamp {
        self.inner
    }
}

pub struct SnapshotBuilder {
    inner: Snapshot,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        SnapshotBuilder {
            inner: Snapshot {
                spec_version: SPEC_VERSION.to_string(),
                version: 0,
                expires: DateTime::<Utc>::default(),
                meta: Default::default(),
            },
        }
    }
}

impl SnapshotBuilder {
    /// Set the expiration date of the snapshot role to this [UTC date](https://en.wikipedia.org/wiki/Coordinated_Universal_Time).
    pub fn with_expiration_utc(
        self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minutes: u32,
        seconds: u32,
    ) -> Self {
        self.with_expires(utc(year, month, day, hour, minutes, seconds))
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.inner.expires = expires;
        self
    }

    /// Add the encoded metadata file `data` under `metapath`.
    pub fn with_meta(mut self, metapath: &str, data: &[u8], version: Version) -> Self {
        self.inner
            .meta
            .insert(metapath.to_string(), MetaFile::for_file(version, data));
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.inner.version = version;
        self
    }

    pub fn build(self) -> Snapshot {
        self.inner
    }
}

pub struct TargetsBuilder {
    inner: Targets,
}

impl Default for TargetsBuilder {
    fn default() -> Self {
        TargetsBuilder {
            inner: Targets {
                spec_version: SPEC_VERSION.to_string(),
                version: 0,
                expires: DateTime::<Utc>::default(),
                targets: Default::default(),
            },
        }
    }
}

impl TargetsBuilder {
    /// Starts from the target list of an existing targets file.
    pub fn from_targets(targets: Targets) -> Self {
        TargetsBuilder { inner: targets }
    }

    pub fn with_expiration_utc(
        self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minutes: u32,
        seconds: u32,
    ) -> Self {
        self.with_expires(utc(year, month, day, hour, minutes, seconds))
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.inner.expires = expires;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.inner.version = version;
        self
    }

    /// Add a target file, hashing `data`.
    pub fn with_target(self, name: &str, data: &[u8]) -> Self {
        self.with_target_file(name, TargetFile::from_bytes(data, None))
    }

    /// Add a target file with application specific data.
    pub fn with_custom_target(self, name: &str, data: &[u8], custom: Value) -> Self {
        self.with_target_file(name, TargetFile::from_bytes(data, Some(custom)))
    }

    pub fn with_target_file(mut self, name: &str, file: TargetFile) -> Self {
        self.inner.targets.insert(name.to_string(), file);
        self
    }

    pub fn build(self) -> Targets {
        self.inner
    }
}

#[cfg(test)]
mod test {
    use super::{RootBuilder, TargetsBuilder};
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::{RoleType, TufError};
    use tuf_ota_json::Key;

    fn key() -> Key {
        Key::from_signing_key(&SigningKey::new(Cipher::Ed25519Dalek)).unwrap()
    }

    #[test]
    fn test_root_threshold_invariant() {
        let k1 = key();
        let k2 = key();
        RootBuilder::default()
            .with_role_and_key(RoleType::Root, &[k1.clone(), k2.clone()], 2)
            .unwrap()
            .build()
            .expect("two keys reach a threshold of two");

        let err = RootBuilder::default()
            .with_role_and_key(RoleType::Root, &[k1.clone()], 2)
            .unwrap()
            .build()
            .expect_err("expected failure");
        assert_eq!(
            err,
            TufError::InvalidRoleThreshold {
                role: RoleType::Root
            }
        );

        // the same key twice does not count twice
        RootBuilder::default()
            .with_role_and_key(RoleType::Timestamp, &[k1.clone(), k1], 2)
            .unwrap()
            .build()
            .expect_err("expected failure");

        RootBuilder::default()
            .with_role_and_key(RoleType::Snapshot, &[k2], 0)
            .unwrap()
            .build()
            .expect_err("expected failure");
    }

    /// Tests if replaced keys disappear from the key list.
    #[test]
    fn test_replacing_role_keys_prunes_old_keys() {
        let old = key();
        let new = key();
        let root = RootBuilder::default()
            .with_role_and_key(RoleType::Timestamp, &[old.clone()], 1)
            .unwrap()
            .with_role_and_key(RoleType::Timestamp, &[new.clone()], 1)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(root.keys.len(), 1);
        assert!(root.keys.contains_key(&new.key_id().unwrap()));
    }

    #[test]
    fn test_targets_builder() {
        let targets = TargetsBuilder::default()
            .with_version(4)
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_target("app-1.0.0.tar.gz", b"hello")
            .build();
        assert_eq!(targets.version, 4);
        assert_eq!(targets.targets["app-1.0.0.tar.gz"].length, 5);
    }
}

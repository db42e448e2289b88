//! Repository side: key management and publishing of signed metadata.
//!
//! A repository directory has the layout
//!
//! ```text
//! {dir}/metadata/{N}.root.json, timestamp.json, snapshot.json, targets.json
//! {dir}/metadata/{V}.snapshot.json, {V}.targets.json   (consistent snapshots)
//! {dir}/targets/{metapath}
//! {dir}/keys/{role}-{n}.pem
//! {dir}/keys.staged/{role}-{n}.pem   (key rotation in progress)
//! ```
pub mod store;

use crate::builder::{RootBuilder, SnapshotBuilder, TargetsBuilder, TimestampBuilder};
use crate::role::root::update_root_step;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use store::{write_atomic, MetadataStore};
use thiserror::Error;
use tracing::{info, warn};
use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
use tuf_ota_common::{RoleType, Threshold, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::Snapshot;
use tuf_ota_json::targets::Targets;
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::{Key, Signed};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Tuf(#[from] TufError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no repository found at {0}")]
    NotInitialized(PathBuf),
    #[error("a repository already exists at {0}")]
    AlreadyInitialized(PathBuf),
    /// Target names must be relative paths without `..` segments.
    #[error("invalid target name `{0}`")]
    InvalidTargetName(String),
}

/// Lifetime of newly signed metadata per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub root: Duration,
    pub targets: Duration,
    pub snapshot: Duration,
    pub timestamp: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        ExpiryPolicy {
            root: Duration::days(365),
            targets: Duration::days(90),
            snapshot: Duration::days(7),
            timestamp: Duration::days(1),
        }
    }
}

impl ExpiryPolicy {
    pub fn expires(&self, role: RoleType, now: DateTime<Utc>) -> DateTime<Utc> {
        let lifetime = match role {
            RoleType::Root => self.root,
            RoleType::Targets => self.targets,
            RoleType::Snapshot => self.snapshot,
            RoleType::Timestamp => self.timestamp,
        };
        now + lifetime
    }
}

/// Keys and threshold of a role when creating or rotating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSetup {
    pub threshold: Threshold,
    pub keys: Vec<Cipher>,
}

impl RoleSetup {
    pub fn single(cipher: Cipher) -> Self {
        RoleSetup {
            threshold: 1,
            keys: vec![cipher],
        }
    }
}

/// Private keys of a repository, by role.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<RoleType, Vec<SigningKey>>,
}

impl Keyring {
    pub fn generate(&mut self, role: RoleType, setup: &RoleSetup) {
        let keys = setup.keys.iter().map(|c| SigningKey::new(*c)).collect();
        self.keys.insert(role, keys);
    }

    pub fn insert(&mut self, role: RoleType, key: SigningKey) {
        self.keys.entry(role).or_default().push(key);
    }

    pub fn keys(&self, role: RoleType) -> &[SigningKey] {
        self.keys.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn public_keys(&self, role: RoleType) -> Result<Vec<Key>, TufError> {
        self.keys(role).iter().map(Key::from_signing_key).collect()
    }

    /// The keys that `root` authorizes for `role`. Fails when they cannot reach the threshold.
    pub fn signers(&self, root: &Root, role: RoleType) -> Result<Vec<SigningKey>, TufError> {
        let authorized = root.role_keys(role).ok_or(TufError::MissingRoleKeys(role))?;
        let threshold = root
            .role_threshold(role)
            .ok_or(TufError::MissingRoleKeys(role))?;
        let mut signers = Vec::new();
        for key in self.keys(role) {
            let key_id = Key::from_signing_key(key)?.key_id()?;
            if authorized.contains_key(&key_id) {
                signers.push(key.clone());
            }
        }
        if signers.len() < threshold as usize {
            return Err(TufError::InsufficientSigningKeys {
                role,
                available: signers.len(),
                threshold,
            });
        }
        Ok(signers)
    }

    /// Reads `{role}-{n}.pem` files from `dir`.
    pub fn load(dir: &Path) -> Result<Self, RepositoryError> {
        let io_err = |source| RepositoryError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((role, index)) = stem.rsplit_once('-') else {
                continue;
            };
            let (Ok(role), Ok(index)) = (role.parse::<RoleType>(), index.parse::<usize>()) else {
                warn!("ignoring unexpected key file {}", path.display());
                continue;
            };
            files.push((role, index, path));
        }
        files.sort();
        let mut keyring = Keyring::default();
        for (role, _, path) in files {
            let pem = std::fs::read_to_string(&path).map_err(|source| RepositoryError::Io {
                path: path.clone(),
                source,
            })?;
            keyring.insert(role, SigningKey::from_pkcs8_pem(&pem)?);
        }
        Ok(keyring)
    }

    /// Writes every key to `dir`, replacing the key files of the roles it holds.
    pub fn write(&self, dir: &Path) -> Result<(), RepositoryError> {
        std::fs::create_dir_all(dir).map_err(|source| RepositoryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for (role, keys) in self.keys.iter() {
            for (index, key) in keys.iter().enumerate() {
                let pem = key.to_pkcs8_pem()?;
                write_atomic(&dir.join(format!("{role}-{index}.pem")), pem.as_bytes())?;
            }
            // drop files of keys that were rotated out
            let mut index = keys.len();
            loop {
                let stale = dir.join(format!("{role}-{index}.pem"));
                if !stale.exists() {
                    break;
                }
                std::fs::remove_file(&stale).map_err(|source| RepositoryError::Io {
                    path: stale.clone(),
                    source,
                })?;
                index += 1;
            }
        }
        Ok(())
    }
}

/// An artifact to add to the targets metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtifact {
    /// Target path, e.g. `app-1.2.0.tar.gz` or `patches/app-1.1.0-1.2.0.patch`.
    pub name: String,
    pub data: Vec<u8>,
    pub custom: Option<Value>,
}

impl NewArtifact {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        NewArtifact {
            name: name.into(),
            data,
            custom: None,
        }
    }

    pub fn with_custom(mut self, custom: Value) -> Self {
        self.custom = Some(custom);
        self
    }
}

/// The documents produced by one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSet {
    pub root_version: Version,
    pub targets: Signed<Targets>,
    pub snapshot: Signed<Snapshot>,
    pub timestamp: Signed<Timestamp>,
}

pub struct Repository {
    dir: PathBuf,
    store: MetadataStore,
    keyring: Keyring,
    expiry: ExpiryPolicy,
}

fn check_target_name(name: &str) -> Result<(), RepositoryError> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(RepositoryError::InvalidTargetName(name.to_string()));
    }
    Ok(())
}

impl Repository {
    pub fn metadata_dir(&self) -> PathBuf {
        self.dir.join("metadata")
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.dir.join("targets")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.dir.join("keys")
    }

    /// Keys of a rotation whose metadata is not written yet.
    pub fn staged_keys_dir(&self) -> PathBuf {
        self.dir.join("keys.staged")
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Creates a new repository with fresh keys, `1.root.json` and empty targets.
    pub fn init(
        dir: &Path,
        roles: &BTreeMap<RoleType, RoleSetup>,
        expiry: ExpiryPolicy,
        consistent_snapshot: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, RepositoryError> {
        if dir.join("metadata").join("1.root.json").exists() {
            return Err(RepositoryError::AlreadyInitialized(dir.to_path_buf()));
        }
        let mut keyring = Keyring::default();
        let mut builder = RootBuilder::default()
            .with_version(1)
            .consistent_snapshot(consistent_snapshot)
            .with_expires(expiry.expires(RoleType::Root, now));
        for role in RoleType::ALL {
            let setup = roles.get(&role).ok_or(TufError::MissingRoleKeys(role))?;
            keyring.generate(role, setup);
            builder = builder.with_role_and_key(role, &keyring.public_keys(role)?, setup.threshold)?;
        }
        let root = builder.build()?;
        let signers = keyring.signers(&root, RoleType::Root)?;
        let mut store = MetadataStore::default();
        store.push_root(Signed::from_signed(root, &signers)?)?;

        let mut repository = Repository {
            dir: dir.to_path_buf(),
            store,
            keyring,
            expiry,
        };
        repository.keyring.write(&repository.keys_dir())?;
        repository.publish(Vec::new(), now)?;
        info!("initialized repository at {}", dir.display());
        Ok(repository)
    }

    /// Opens an existing repository.
    pub fn open(dir: &Path, expiry: ExpiryPolicy) -> Result<Self, RepositoryError> {
        let metadata = dir.join("metadata");
        if !metadata.join("1.root.json").exists() {
            return Err(RepositoryError::NotInitialized(dir.to_path_buf()));
        }
        let mut repository = Repository {
            dir: dir.to_path_buf(),
            store: MetadataStore::load(&metadata)?,
            keyring: Keyring::default(),
            expiry,
        };
        if repository.staged_keys_dir().exists() {
            repository.resolve_staged_keys()?;
        }
        repository.keyring = Keyring::load(&repository.keys_dir())?;
        Ok(repository)
    }

    /// Finishes a key rotation that was interrupted. The staged keys are kept if the newest
    /// root authorizes them for every role, otherwise the rotation never reached the metadata.
    fn resolve_staged_keys(&self) -> Result<(), RepositoryError> {
        let staged_dir = self.staged_keys_dir();
        let staged = Keyring::load(&staged_dir)?;
        let root = self.current_root()?;
        if RoleType::ALL
            .into_iter()
            .all(|role| staged.signers(root, role).is_ok())
        {
            info!("completing interrupted key rotation for root {}", root.version);
            staged.write(&self.keys_dir())?;
        } else {
            warn!("discarding keys of an unfinished key rotation");
        }
        remove_dir(&staged_dir)
    }

    fn current_root(&self) -> Result<&Root, RepositoryError> {
        self.store
            .root()
            .map(|r| &r.signed)
            .ok_or_else(|| RepositoryError::NotInitialized(self.dir.clone()))
    }

    /// Adds `artifacts` to the targets and signs new targets, snapshot and timestamp versions.
    /// Every signer is checked before anything is written.
    pub fn publish(
        &mut self,
        artifacts: Vec<NewArtifact>,
        now: DateTime<Utc>,
    ) -> Result<MetadataSet, RepositoryError> {
        for artifact in artifacts.iter() {
            check_target_name(&artifact.name)?;
        }
        let root = self.current_root()?;
        let targets_signers = self.keyring.signers(root, RoleType::Targets)?;
        let snapshot_signers = self.keyring.signers(root, RoleType::Snapshot)?;
        let timestamp_signers = self.keyring.signers(root, RoleType::Timestamp)?;
        let root_version = root.version;

        let mut targets = match self.store.targets() {
            Some(previous) => TargetsBuilder::from_targets(previous.signed.clone()),
            None => TargetsBuilder::default(),
        }
        .with_version(next_version(self.store.targets().map(|t| t.signed.version)))
        .with_expires(self.expiry.expires(RoleType::Targets, now));
        for artifact in artifacts.iter() {
            targets = match &artifact.custom {
                Some(custom) => {
                    targets.with_custom_target(&artifact.name, &artifact.data, custom.clone())
                }
                None => targets.with_target(&artifact.name, &artifact.data),
            };
        }
        let targets = Signed::from_signed(targets.build(), &targets_signers)?;
        let targets_json = targets.to_json()?;

        let snapshot_version = next_version(self.store.snapshot().map(|s| s.signed.version));
        let snapshot = SnapshotBuilder::default()
            .with_version(snapshot_version)
            .with_expires(self.expiry.expires(RoleType::Snapshot, now))
            .with_meta(
                &RoleType::Targets.metapath(),
                &targets_json,
                targets.signed.version,
            )
            .build();
        let snapshot = Signed::from_signed(snapshot, &snapshot_signers)?;
        let timestamp = self.sign_timestamp(&snapshot, &timestamp_signers, now)?;

        for artifact in artifacts.iter() {
            write_atomic(&self.targets_dir().join(&artifact.name), &artifact.data)?;
        }
        self.store.set_targets(targets.clone());
        self.store.set_snapshot(snapshot.clone());
        self.store.set_timestamp(timestamp.clone());
        self.store.write(&self.metadata_dir())?;
        info!(
            "published targets {} with {} new artifact(s)",
            targets.signed.version,
            artifacts.len()
        );
        Ok(MetadataSet {
            root_version,
            targets,
            snapshot,
            timestamp,
        })
    }

    fn sign_timestamp(
        &self,
        snapshot: &Signed<Snapshot>,
        signers: &[SigningKey],
        now: DateTime<Utc>,
    ) -> Result<Signed<Timestamp>, RepositoryError> {
        let timestamp = TimestampBuilder::default()
            .with_version(next_version(self.store.timestamp().map(|t| t.signed.version)))
            .with_expires(self.expiry.expires(RoleType::Timestamp, now))
            .with_snapshot(&snapshot.to_json()?, snapshot.signed.version)
            .build();
        Ok(Signed::from_signed(timestamp, signers)?)
    }

    /// Signs a new timestamp for the current snapshot.
    pub fn reissue_timestamp(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Signed<Timestamp>, RepositoryError> {
        let root = self.current_root()?;
        let signers = self.keyring.signers(root, RoleType::Timestamp)?;
        let snapshot = self
            .store
            .snapshot()
            .ok_or(TufError::MissingSnapshotFile)?;
        let timestamp = self.sign_timestamp(snapshot, &signers, now)?;
        self.store.set_timestamp(timestamp.clone());
        self.store.write(&self.metadata_dir())?;
        info!("issued timestamp {}", timestamp.signed.version);
        Ok(timestamp)
    }

    /// Replaces the keys of `role` and writes the next root version, signed by the previous
    /// root keys and the new root keys. Targets, snapshot and timestamp are signed again.
    pub fn rotate_keys(
        &mut self,
        role: RoleType,
        setup: &RoleSetup,
        now: DateTime<Utc>,
    ) -> Result<MetadataSet, RepositoryError> {
        let old_root = self
            .store
            .root()
            .ok_or_else(|| RepositoryError::NotInitialized(self.dir.clone()))?
            .clone();
        let old_signers = self.keyring.signers(&old_root.signed, RoleType::Root)?;

        let mut keyring = self.keyring.clone();
        keyring.generate(role, setup);
        let root = RootBuilder::from_root(old_root.signed.clone())
            .with_role_and_key(role, &keyring.public_keys(role)?, setup.threshold)?
            .with_version(old_root.signed.version + 1)
            .with_expires(self.expiry.expires(RoleType::Root, now))
            .build()?;
        let mut signers = old_signers;
        for key in keyring.signers(&root, RoleType::Root)? {
            if !signers.iter().any(|s| s.key_id().ok() == key.key_id().ok()) {
                signers.push(key);
            }
        }
        let new_root = Signed::from_signed(root, &signers)?;
        // clients have to be able to follow the chain
        let new_root = update_root_step(&old_root, new_root)?;

        // the new keys only replace the old ones once the metadata that authorizes them is written
        let staged_dir = self.staged_keys_dir();
        if staged_dir.exists() {
            remove_dir(&staged_dir)?;
        }
        keyring.write(&staged_dir)?;
        self.store.push_root(new_root)?;
        self.keyring = keyring;
        let set = self.publish(Vec::new(), now)?;
        self.keyring.write(&self.keys_dir())?;
        remove_dir(&staged_dir)?;
        info!(
            "rotated {role} keys, root version {}",
            old_root.signed.version + 1
        );
        Ok(set)
    }
}

fn remove_dir(path: &Path) -> Result<(), RepositoryError> {
    std::fs::remove_dir_all(path).map_err(|source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn next_version(previous: Option<Version>) -> Version {
    previous.map(|v| v + 1).unwrap_or(1)
}

//! Client side refresh of the trusted metadata.
//!
//! A [Refresher] owns the metadata storage and the currently trusted [TrustedSet]. A refresh
//! walks `Start -> RootUpdate -> Timestamp -> Snapshot -> Targets -> Done` and only writes to
//! storage once every step succeeded. Readers always see a complete set, the new one is
//! published by swapping an [Arc].
use crate::role::root::{check_role_thresholds, update_root, RootUpdate};
use crate::role::snapshot::verify_snapshot;
use crate::role::targets::{target_description, verify_target_file, verify_targets};
use crate::role::timestamp::{verify_timestamp, TimestampUpdate};
use crate::role::{check_meta_file, DecodeRole, TufRole};
use crate::verifier;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use tuf_ota_common::remote::TufTransport;
use tuf_ota_common::storage::TufStorage;
use tuf_ota_common::{RoleType, TufError, Version};
use tuf_ota_json::root::Root;
use tuf_ota_json::snapshot::Snapshot;
use tuf_ota_json::targets::{TargetFile, Targets};
use tuf_ota_json::timestamp::Timestamp;
use tuf_ota_json::Signed;

/// A verified document together with the bytes it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trusted<T> {
    pub document: Signed<T>,
    pub raw: Vec<u8>,
}

impl<T: TufRole> Trusted<T> {
    fn decode(raw: &[u8]) -> Result<Self, TufError> {
        Ok(Trusted {
            document: Signed::<T>::decode_role(raw)?,
            raw: raw.to_vec(),
        })
    }

    pub fn version(&self) -> Version {
        self.document.signed.version()
    }
}

/// Immutable view of the metadata the client currently trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedSet {
    pub root: Trusted<Root>,
    pub timestamp: Option<Trusted<Timestamp>>,
    pub snapshot: Option<Trusted<Snapshot>>,
    pub targets: Option<Trusted<Targets>>,
}

impl TrustedSet {
    /// Loads the trusted state from storage. Documents that no longer decode are dropped,
    /// the next refresh fetches them again.
    pub fn from_storage<S: TufStorage + ?Sized>(storage: &S) -> Result<Self, TufError> {
        let root = Trusted::<Root>::decode(storage.current_root())?;
        check_role_thresholds(&root.document.signed)?;
        Ok(TrustedSet {
            root,
            timestamp: decode_stored(storage.current_timestamp()),
            snapshot: decode_stored(storage.current_snapshot()),
            targets: decode_stored(storage.current_targets()),
        })
    }

    pub fn root(&self) -> &Root {
        &self.root.document.signed
    }

    pub fn targets(&self) -> Option<&Targets> {
        self.targets.as_ref().map(|t| &t.document.signed)
    }

    /// Description of the target file at `metapath`.
    pub fn target(&self, metapath: &str) -> Result<&TargetFile, TufError> {
        let targets = self.targets().ok_or(TufError::MissingTargetsFile)?;
        target_description(targets, metapath)
    }

    /// Checks a complete target file against the trusted targets metadata.
    pub fn verify_target(&self, metapath: &str, data: &[u8]) -> Result<(), TufError> {
        let targets = self.targets().ok_or(TufError::MissingTargetsFile)?;
        verify_target_file(targets, metapath, data)
    }
}

fn decode_stored<T: TufRole>(raw: Option<&[u8]>) -> Option<Trusted<T>> {
    let raw = raw?;
    match Trusted::decode(raw) {
        Ok(trusted) => Some(trusted),
        Err(err) => {
            warn!("dropping stored {} metadata: {err}", T::TYPE);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Start,
    RootUpdate,
    Timestamp,
    Snapshot,
    Targets,
    Done,
    Failed,
}

/// Summary of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// Every root hop as `(from, to)`.
    pub rotations: Vec<(Version, Version)>,
    pub root_version: Version,
    pub timestamp_version: Version,
    pub snapshot_version: Version,
    pub targets_version: Version,
    /// Whether any trusted document changed.
    pub changed: bool,
}

pub struct Refresher<S> {
    storage: Mutex<S>,
    trusted: RwLock<Arc<TrustedSet>>,
    state: std::sync::Mutex<RefreshState>,
    max_root_rotations: u32,
}

impl<S: TufStorage> Refresher<S> {
    pub fn new(storage: S, max_root_rotations: u32) -> Result<Self, TufError> {
        let trusted = TrustedSet::from_storage(&storage)?;
        Ok(Refresher {
            storage: Mutex::new(storage),
            trusted: RwLock::new(Arc::new(trusted)),
            state: std::sync::Mutex::new(RefreshState::Start),
            max_root_rotations,
        })
    }

    /// The currently trusted metadata.
    pub fn trusted(&self) -> Arc<TrustedSet> {
        self.trusted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Access to the underlying storage. Waits for a running refresh.
    pub async fn storage(&self) -> MutexGuard<'_, S> {
        self.storage.lock().await
    }

    fn set_state(&self, state: RefreshState) {
        debug!("refresh state: {state:?}");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run a full metadata refresh. For more information refer to the [TUF specification](https://theupdateframework.github.io/specification/latest/#detailed-client-workflow).
    /// `update_start` is the clock that expiration dates are checked against.
    /// Concurrent calls are serialized.
    pub async fn refresh<T>(
        &self,
        transport: &T,
        update_start: &DateTime<Utc>,
    ) -> Result<RefreshReport, TufError>
    where
        T: TufTransport + ?Sized,
    {
        let mut storage = self.storage.lock().await;
        let current = self.trusted();
        self.set_state(RefreshState::Start);

        let outcome = match self.fetch_and_verify(transport, &current, update_start).await {
            Ok((root_update, next)) => {
                match commit(&mut *storage, &root_update, &current, &next) {
                    Ok(()) => Ok((root_update, next)),
                    Err(err) => {
                        if let Err(e) = restore(&mut *storage, &current) {
                            warn!("failed to restore trusted metadata: {e}");
                        }
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        };
        let (root_update, next) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                storage.discard_uncommitted_roots();
                warn!("metadata refresh failed in state {:?}: {err}", self.state());
                self.set_state(RefreshState::Failed);
                return Err(err);
            }
        };

        let report = report(&root_update, &current, &next);
        *self.trusted.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        self.set_state(RefreshState::Done);
        info!(
            "trusted metadata: root {}, timestamp {}, snapshot {}, targets {}",
            report.root_version,
            report.timestamp_version,
            report.snapshot_version,
            report.targets_version
        );
        Ok(report)
    }

    async fn fetch_and_verify<T>(
        &self,
        transport: &T,
        current: &TrustedSet,
        update_start: &DateTime<Utc>,
    ) -> Result<(RootUpdate, TrustedSet), TufError>
    where
        T: TufTransport + ?Sized,
    {
        self.set_state(RefreshState::RootUpdate);
        let root_update = update_root(
            transport,
            &current.root.document,
            self.max_root_rotations,
            update_start,
        )
        .await?;
        let root = match root_update.chain.last() {
            Some((_, raw)) => Trusted {
                document: root_update.root.clone(),
                raw: raw.clone(),
            },
            None => current.root.clone(),
        };
        let trusted_timestamp = current
            .timestamp
            .as_ref()
            .filter(|_| !root_update.delete_timestamp);
        let trusted_snapshot = current
            .snapshot
            .as_ref()
            .filter(|_| !root_update.delete_snapshot);
        let root_doc = &root.document.signed;

        self.set_state(RefreshState::Timestamp);
        let raw = transport.fetch_timestamp().await?;
        let timestamp = match verify_timestamp(
            root_doc,
            trusted_timestamp.map(|t| &t.document),
            trusted_snapshot.map(Trusted::version),
            &raw,
            update_start,
        )? {
            TimestampUpdate::New(document) => Trusted { document, raw },
            TimestampUpdate::Unchanged => match trusted_timestamp {
                Some(trusted) => {
                    verifier::verify(&trusted.document, root_doc, update_start)?;
                    trusted.clone()
                }
                None => return Err(TufError::MissingTimestampFile),
            },
        };

        self.set_state(RefreshState::Snapshot);
        let snapshot_meta = timestamp
            .document
            .signed
            .snapshot_meta()
            .ok_or(TufError::MissingSnapshotFile)?;
        let snapshot = match trusted_snapshot.filter(|old| {
            old.version() == snapshot_meta.version
                && check_meta_file(&RoleType::Snapshot.metapath(), snapshot_meta, &old.raw).is_ok()
        }) {
            Some(old) => {
                debug!("snapshot {} unchanged", old.version());
                verifier::verify(&old.document, root_doc, update_start)?;
                old.clone()
            }
            None => {
                let version = root_doc.consistent_snapshot.then_some(snapshot_meta.version);
                let raw = transport.fetch_snapshot(version).await?;
                let document = verify_snapshot(
                    root_doc,
                    &timestamp.document.signed,
                    trusted_snapshot.map(|t| &t.document),
                    &raw,
                    update_start,
                )?;
                Trusted { document, raw }
            }
        };

        self.set_state(RefreshState::Targets);
        let targets_meta = snapshot
            .document
            .signed
            .targets_meta()
            .ok_or(TufError::MissingTargetsFile)?;
        let trusted_targets = current.targets.as_ref();
        let targets = match trusted_targets.filter(|old| {
            old.version() == targets_meta.version
                && check_meta_file(&RoleType::Targets.metapath(), targets_meta, &old.raw).is_ok()
        }) {
            Some(old) => {
                debug!("targets {} unchanged", old.version());
                verifier::verify(&old.document, root_doc, update_start)?;
                old.clone()
            }
            None => {
                let version = root_doc.consistent_snapshot.then_some(targets_meta.version);
                let raw = transport.fetch_targets(version).await?;
                let document = verify_targets(
                    root_doc,
                    &snapshot.document.signed,
                    trusted_targets.map(|t| &t.document),
                    &raw,
                    update_start,
                )?;
                Trusted { document, raw }
            }
        };

        Ok((
            root_update,
            TrustedSet {
                root,
                timestamp: Some(timestamp),
                snapshot: Some(snapshot),
                targets: Some(targets),
            },
        ))
    }
}

/// Writes the verified state. Staged roots are only committed after every other file was
/// written.
fn commit<S: TufStorage + ?Sized>(
    storage: &mut S,
    root_update: &RootUpdate,
    current: &TrustedSet,
    next: &TrustedSet,
) -> Result<(), TufError> {
    for (version, raw) in root_update.chain.iter() {
        storage.persist_root(*version, raw)?;
    }
    if root_update.delete_timestamp {
        storage.delete_timestamp_metadata()?;
    }
    if root_update.delete_snapshot {
        storage.delete_snapshot_metadata()?;
    }
    persist_if_changed(current.targets.as_ref(), next.targets.as_ref(), |raw| {
        storage.persist_targets(raw)
    })?;
    persist_if_changed(current.snapshot.as_ref(), next.snapshot.as_ref(), |raw| {
        storage.persist_snapshot(raw)
    })?;
    persist_if_changed(current.timestamp.as_ref(), next.timestamp.as_ref(), |raw| {
        storage.persist_timestamp(raw)
    })?;
    if !root_update.chain.is_empty() {
        storage.commit_root()?;
    }
    Ok(())
}

/// Writes back the documents of `current` after a failed commit, so that storage holds the
/// set that stays trusted instead of a mix of old and new files.
fn restore<S: TufStorage + ?Sized>(
    storage: &mut S,
    current: &TrustedSet,
) -> Result<(), TufError> {
    let targets = current.targets.as_ref().map(|t| t.raw.as_slice());
    if storage.current_targets() != targets {
        match targets {
            Some(raw) => storage.persist_targets(raw)?,
            None => warn!("targets metadata of the failed refresh stays in storage"),
        }
    }
    let snapshot = current.snapshot.as_ref().map(|t| t.raw.as_slice());
    if storage.current_snapshot() != snapshot {
        match snapshot {
            Some(raw) => storage.persist_snapshot(raw)?,
            None => storage.delete_snapshot_metadata()?,
        }
    }
    let timestamp = current.timestamp.as_ref().map(|t| t.raw.as_slice());
    if storage.current_timestamp() != timestamp {
        match timestamp {
            Some(raw) => storage.persist_timestamp(raw)?,
            None => storage.delete_timestamp_metadata()?,
        }
    }
    Ok(())
}

fn persist_if_changed<T>(
    current: Option<&Trusted<T>>,
    next: Option<&Trusted<T>>,
    mut persist: impl FnMut(&[u8]) -> Result<(), TufError>,
) -> Result<(), TufError> {
    match next {
        Some(next) if current.map(|c| c.raw != next.raw).unwrap_or(true) => persist(&next.raw),
        _ => Ok(()),
    }
}

fn report(root_update: &RootUpdate, current: &TrustedSet, next: &TrustedSet) -> RefreshReport {
    let mut from = current.root.version();
    let rotations = root_update
        .chain
        .iter()
        .map(|(to, _)| {
            let hop = (from, *to);
            from = *to;
            hop
        })
        .collect();
    RefreshReport {
        rotations,
        root_version: next.root.version(),
        timestamp_version: next.timestamp.as_ref().map(Trusted::version).unwrap_or(0),
        snapshot_version: next.snapshot.as_ref().map(Trusted::version).unwrap_or(0),
        targets_version: next.targets.as_ref().map(Trusted::version).unwrap_or(0),
        changed: next != current,
    }
}

#[cfg(test)]
mod test {
    use super::{RefreshState, Refresher};
    use crate::builder::{RootBuilder, SnapshotBuilder, TargetsBuilder, TimestampBuilder};
    use crate::utils::{MemoryStorage, MemoryTransport};
    use chrono::{TimeZone, Utc};
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::storage::TufStorage;
    use tuf_ota_common::{RoleType, TufError, Version};
    use tuf_ota_json::root::Root;
    use tuf_ota_json::{Key, Signed};

    struct Keys {
        root: SigningKey,
        timestamp: SigningKey,
        snapshot: SigningKey,
        targets: SigningKey,
    }

    impl Keys {
        fn generate() -> Self {
            Keys {
                root: SigningKey::new(Cipher::Ed25519Dalek),
                timestamp: SigningKey::new(Cipher::Ed25519Dalek),
                snapshot: SigningKey::new(Cipher::Ecdsa),
                targets: SigningKey::new(Cipher::Ed25519Dalek),
            }
        }
    }

    fn public(key: &SigningKey) -> Vec<Key> {
        vec![Key::from_signing_key(key).unwrap()]
    }

    fn root(keys: &Keys, version: u32, consistent: bool) -> Root {
        RootBuilder::default()
            .with_role_and_key(RoleType::Root, &public(&keys.root), 1)
            .unwrap()
            .with_role_and_key(RoleType::Timestamp, &public(&keys.timestamp), 1)
            .unwrap()
            .with_role_and_key(RoleType::Snapshot, &public(&keys.snapshot), 1)
            .unwrap()
            .with_role_and_key(RoleType::Targets, &public(&keys.targets), 1)
            .unwrap()
            .consistent_snapshot(consistent)
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .build()
            .unwrap()
    }

    /// Publishes targets, snapshot and timestamp with the given versions into `transport`.
    fn publish(
        keys: &Keys,
        transport: MemoryTransport,
        version: u32,
        artifact: &[u8],
    ) -> MemoryTransport {
        let targets = TargetsBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .with_target("app-1.0.0.tar.gz", artifact)
            .build();
        let targets = Signed::from_signed(targets, &[keys.targets.clone()])
            .unwrap()
            .to_json()
            .unwrap();
        let snapshot = SnapshotBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .with_meta("targets.json", &targets, version)
            .build();
        let snapshot = Signed::from_signed(snapshot, &[keys.snapshot.clone()])
            .unwrap()
            .to_json()
            .unwrap();
        let timestamp = TimestampBuilder::default()
            .with_expiration_utc(2030, 1, 1, 0, 0, 0)
            .with_version(version)
            .with_snapshot(&snapshot, version)
            .build();
        let timestamp = Signed::from_signed(timestamp, &[keys.timestamp.clone()])
            .unwrap()
            .to_json()
            .unwrap();
        transport
            .with_targets(version, targets)
            .with_snapshot(version, snapshot)
            .with_timestamp(timestamp)
            .with_target_file("app-1.0.0.tar.gz", artifact.to_vec())
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup(consistent: bool) -> (Keys, Signed<Root>, Refresher<MemoryStorage>) {
        let keys = Keys::generate();
        let root = Signed::from_signed(root(&keys, 1, consistent), &[keys.root.clone()]).unwrap();
        let storage = MemoryStorage::new(&root.to_json().unwrap()).unwrap();
        let refresher = Refresher::new(storage, 32).unwrap();
        (keys, root, refresher)
    }

    #[tokio::test]
    async fn test_refresh() {
        let (keys, root, refresher) = setup(true);
        let transport = MemoryTransport::default().with_roots(&[root]).unwrap();
        let transport = publish(&keys, transport, 1, b"hello");

        let report = refresher.refresh(&transport, &now()).await.unwrap();
        assert_eq!(refresher.state(), RefreshState::Done);
        assert!(report.changed);
        assert_eq!(report.targets_version, 1);
        let trusted = refresher.trusted();
        trusted.verify_target("app-1.0.0.tar.gz", b"hello").unwrap();
        trusted
            .verify_target("app-1.0.0.tar.gz", b"hellp")
            .expect_err("accepted modified target");

        let storage = refresher.storage().await;
        assert!(storage.timestamp.is_some());
        assert!(storage.snapshot.is_some());
        assert!(storage.targets.is_some());
    }

    /// Tests if a second refresh without remote changes changes nothing.
    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let (keys, root, refresher) = setup(true);
        let transport = MemoryTransport::default().with_roots(&[root]).unwrap();
        let transport = publish(&keys, transport, 1, b"hello");

        refresher.refresh(&transport, &now()).await.unwrap();
        let first = refresher.trusted();
        let report = refresher.refresh(&transport, &now()).await.unwrap();
        assert!(!report.changed);
        assert_eq!(*first, *refresher.trusted());
    }

    #[tokio::test]
    async fn test_refresh_rejects_timestamp_rollback() {
        let (keys, root, refresher) = setup(false);
        let transport = MemoryTransport::default().with_roots(&[root]).unwrap();
        let old = publish(&keys, transport.clone(), 1, b"hello");
        let new = publish(&keys, transport, 2, b"hello");

        refresher.refresh(&new, &now()).await.unwrap();
        let trusted = refresher.trusted();
        let err = refresher
            .refresh(&old, &now())
            .await
            .expect_err("accepted rollback");
        assert_eq!(
            err,
            TufError::RollbackDetected {
                role: RoleType::Timestamp,
                trusted: 2,
                offered: 1
            }
        );
        assert_eq!(refresher.state(), RefreshState::Failed);
        // nothing was swapped or persisted
        assert_eq!(*trusted, *refresher.trusted());
        let storage = refresher.storage().await;
        assert_eq!(
            storage.timestamp.as_deref(),
            trusted.timestamp.as_ref().map(|t| t.raw.as_slice())
        );
    }

    /// Tests if a failure after the root update leaves the old root trusted.
    #[tokio::test]
    async fn test_refresh_failure_does_not_commit_root() {
        let (keys, root, refresher) = setup(false);
        let root_2 = Signed::from_signed(root_of(&keys, 2), &[keys.root.clone()]).unwrap();
        let transport = MemoryTransport::default()
            .with_roots(&[root, root_2])
            .unwrap();
        // snapshot signed by the wrong key
        let mut bad_keys = Keys::generate();
        bad_keys.timestamp = keys.timestamp.clone();
        let transport = publish(&bad_keys, transport, 1, b"hello");

        let err = refresher
            .refresh(&transport, &now())
            .await
            .expect_err("accepted snapshot signed by unknown key");
        assert!(matches!(
            err,
            TufError::InsufficientSignatures {
                role: RoleType::Snapshot,
                ..
            }
        ));
        assert_eq!(refresher.trusted().root.version(), 1);
        let storage = refresher.storage().await;
        assert_eq!(storage.roots.len(), 1);
        assert!(storage.uncommitted_roots.is_empty());
        assert!(storage.timestamp.is_none());
    }

    fn root_of(keys: &Keys, version: u32) -> Root {
        root(keys, version, false)
    }

    #[tokio::test]
    async fn test_refresh_reports_rotations() {
        let (keys, root, refresher) = setup(false);
        let roots = [
            root,
            Signed::from_signed(root_of(&keys, 2), &[keys.root.clone()]).unwrap(),
            Signed::from_signed(root_of(&keys, 3), &[keys.root.clone()]).unwrap(),
        ];
        let transport = MemoryTransport::default().with_roots(&roots).unwrap();
        let transport = publish(&keys, transport, 1, b"hello");

        let report = refresher.refresh(&transport, &now()).await.unwrap();
        assert_eq!(report.rotations, vec![(1, 2), (2, 3)]);
        assert_eq!(report.root_version, 3);
        let storage = refresher.storage().await;
        assert_eq!(storage.roots.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_refresh_rejects_modified_targets() {
        let (keys, root, refresher) = setup(true);
        let transport = MemoryTransport::default().with_roots(&[root]).unwrap();
        let mut transport = publish(&keys, transport, 1, b"hello");
        let targets = transport.targets_versions.get_mut(&1).unwrap();
        let last = targets.len() - 2;
        targets[last] ^= 1;

        let err = refresher
            .refresh(&transport, &now())
            .await
            .expect_err("accepted modified targets");
        assert!(matches!(err, TufError::InvalidHash { .. }));
        assert!(refresher.trusted().targets.is_none());
    }

    /// Tests if a stored root that needs no timestamp signatures is not trusted.
    #[test]
    fn test_stored_root_with_zero_threshold_rejected() {
        let keys = Keys::generate();
        let mut body = root(&keys, 1, false);
        body.roles.get_mut(&RoleType::Timestamp).unwrap().threshold = 0;
        let signed = Signed::from_signed(body, &[keys.root.clone()]).unwrap();
        let storage = MemoryStorage::new(&signed.to_json().unwrap()).unwrap();
        let err = Refresher::new(storage, 32).err().expect("trusted invalid root");
        assert_eq!(
            err,
            TufError::InvalidRoleThreshold {
                role: RoleType::Timestamp
            }
        );
    }

    /// [MemoryStorage] whose snapshot writes fail on demand.
    struct BrokenSnapshotWrites {
        inner: MemoryStorage,
        fail: bool,
    }

    impl TufStorage for BrokenSnapshotWrites {
        fn delete_timestamp_metadata(&mut self) -> Result<(), TufError> {
            self.inner.delete_timestamp_metadata()
        }

        fn delete_snapshot_metadata(&mut self) -> Result<(), TufError> {
            self.inner.delete_snapshot_metadata()
        }

        fn persist_root(&mut self, version: Version, data: &[u8]) -> Result<(), TufError> {
            self.inner.persist_root(version, data)
        }

        fn persist_timestamp(&mut self, data: &[u8]) -> Result<(), TufError> {
            self.inner.persist_timestamp(data)
        }

        fn persist_snapshot(&mut self, data: &[u8]) -> Result<(), TufError> {
            if self.fail {
                return Err(TufError::CouldNotPersistMetadata("disk full".to_string()));
            }
            self.inner.persist_snapshot(data)
        }

        fn persist_targets(&mut self, data: &[u8]) -> Result<(), TufError> {
            self.inner.persist_targets(data)
        }

        fn commit_root(&mut self) -> Result<(), TufError> {
            self.inner.commit_root()
        }

        fn discard_uncommitted_roots(&mut self) {
            self.inner.discard_uncommitted_roots()
        }

        fn current_root(&self) -> &[u8] {
            self.inner.current_root()
        }

        fn current_uncommitted_root(&self) -> Option<&[u8]> {
            self.inner.current_uncommitted_root()
        }

        fn current_timestamp(&self) -> Option<&[u8]> {
            self.inner.current_timestamp()
        }

        fn current_snapshot(&self) -> Option<&[u8]> {
            self.inner.current_snapshot()
        }

        fn current_targets(&self) -> Option<&[u8]> {
            self.inner.current_targets()
        }
    }

    /// Tests if a failed write leaves the previously trusted files in storage.
    #[tokio::test]
    async fn test_failed_commit_restores_storage() {
        let keys = Keys::generate();
        let root = Signed::from_signed(root(&keys, 1, false), &[keys.root.clone()]).unwrap();
        let storage = BrokenSnapshotWrites {
            inner: MemoryStorage::new(&root.to_json().unwrap()).unwrap(),
            fail: false,
        };
        let refresher = Refresher::new(storage, 32).unwrap();
        let transport = MemoryTransport::default().with_roots(&[root]).unwrap();
        refresher
            .refresh(&publish(&keys, transport.clone(), 1, b"one"), &now())
            .await
            .unwrap();
        let trusted = refresher.trusted();

        refresher.storage().await.fail = true;
        let err = refresher
            .refresh(&publish(&keys, transport, 2, b"two"), &now())
            .await
            .expect_err("refresh succeeded without storage");
        assert!(matches!(err, TufError::CouldNotPersistMetadata(_)));
        assert_eq!(*trusted, *refresher.trusted());
        let storage = refresher.storage().await;
        assert_eq!(
            storage.inner.targets,
            trusted.targets.as_ref().map(|t| t.raw.clone())
        );
        assert_eq!(
            storage.inner.snapshot,
            trusted.snapshot.as_ref().map(|t| t.raw.clone())
        );
        assert_eq!(
            storage.inner.timestamp,
            trusted.timestamp.as_ref().map(|t| t.raw.clone())
        );
    }
}

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tuf_ota::common::crypto::sign::Cipher;
use tuf_ota::common::{RoleType, TufError};
use tuf_ota::refresh::Refresher;
use tuf_ota::remote::TufTransport;
use tuf_ota::repository::{ExpiryPolicy, NewArtifact, Repository, RoleSetup};
use tuf_ota::utils::{MemoryStorage, MemoryTransport};

fn roles() -> BTreeMap<RoleType, RoleSetup> {
    BTreeMap::from([
        (
            RoleType::Root,
            RoleSetup {
                threshold: 2,
                keys: vec![Cipher::Ed25519Dalek, Cipher::Ecdsa],
            },
        ),
        (RoleType::Timestamp, RoleSetup::single(Cipher::Ed25519Dalek)),
        (RoleType::Snapshot, RoleSetup::single(Cipher::Ecdsa)),
        (RoleType::Targets, RoleSetup::single(Cipher::Ed25519Dalek)),
    ])
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn client(repo: &Path) -> anyhow::Result<Refresher<MemoryStorage>> {
    let root = std::fs::read(repo.join("metadata/1.root.json"))?;
    Ok(Refresher::new(MemoryStorage::new(&root)?, 32)?)
}

#[tokio::test]
async fn test_publish_and_refresh() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut repo = Repository::init(dir.path(), &roles(), ExpiryPolicy::default(), true, now())?;
    let artifact = vec![42u8; 1000];
    repo.publish(
        vec![NewArtifact::new("app-2.0.0.tar.gz", artifact.clone())],
        now(),
    )?;

    let refresher = client(dir.path())?;
    let transport = MemoryTransport::from_repository_dir(dir.path())?;
    let report = refresher.refresh(&transport, &now()).await?;
    assert_eq!(report.targets_version, 2);

    let data = transport
        .fetch_target_bytes("app-2.0.0.tar.gz", 1000)
        .await?;
    refresher.trusted().verify_target("app-2.0.0.tar.gz", &data)?;

    let mut truncated = data.clone();
    truncated.truncate(900);
    let err = refresher
        .trusted()
        .verify_target("app-2.0.0.tar.gz", &truncated)
        .expect_err("accepted truncated artifact");
    assert!(matches!(err, TufError::InvalidLength { .. }));
    Ok(())
}

#[tokio::test]
async fn test_key_rotation_is_followed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut repo = Repository::init(dir.path(), &roles(), ExpiryPolicy::default(), true, now())?;
    let refresher = client(dir.path())?;
    refresher
        .refresh(&MemoryTransport::from_repository_dir(dir.path())?, &now())
        .await?;

    repo.rotate_keys(RoleType::Root, &RoleSetup::single(Cipher::Ecdsa), now())?;
    repo.rotate_keys(
        RoleType::Timestamp,
        &RoleSetup::single(Cipher::Ecdsa),
        now(),
    )?;
    repo.publish(vec![NewArtifact::new("app-2.1.0.tar.gz", vec![1; 64])], now())?;

    let report = refresher
        .refresh(&MemoryTransport::from_repository_dir(dir.path())?, &now())
        .await?;
    assert_eq!(report.rotations, vec![(1, 2), (2, 3)]);
    assert_eq!(refresher.trusted().root.version(), 3);
    assert!(refresher.trusted().target("app-2.1.0.tar.gz").is_ok());
    let storage = refresher.storage().await;
    assert_eq!(storage.roots.len(), 3);
    Ok(())
}

/// Tests if a mirror replaying older metadata is detected.
#[tokio::test]
async fn test_replayed_metadata_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut repo = Repository::init(dir.path(), &roles(), ExpiryPolicy::default(), true, now())?;
    let stale = MemoryTransport::from_repository_dir(dir.path())?;
    repo.publish(vec![NewArtifact::new("app-2.0.0.tar.gz", vec![7; 10])], now())?;
    let fresh = MemoryTransport::from_repository_dir(dir.path())?;

    let refresher = client(dir.path())?;
    refresher.refresh(&fresh, &now()).await?;
    let err = refresher
        .refresh(&stale, &now())
        .await
        .expect_err("accepted replayed timestamp");
    assert!(matches!(
        err,
        TufError::RollbackDetected {
            role: RoleType::Timestamp,
            ..
        }
    ));
    assert!(refresher.trusted().target("app-2.0.0.tar.gz").is_ok());
    Ok(())
}

/// Tests if metadata older than its expiry date is refused (freeze attack).
#[tokio::test]
async fn test_frozen_metadata_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    Repository::init(dir.path(), &roles(), ExpiryPolicy::default(), true, now())?;
    let refresher = client(dir.path())?;
    let later = now() + chrono::Duration::days(2);
    let err = refresher
        .refresh(&MemoryTransport::from_repository_dir(dir.path())?, &later)
        .await
        .expect_err("accepted expired timestamp");
    assert!(matches!(
        err,
        TufError::ExpiredMetadata {
            role: RoleType::Timestamp,
            ..
        }
    ));
    Ok(())
}

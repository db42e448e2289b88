use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tuf_ota::repository::{ExpiryPolicy, RoleSetup};
use tuf_ota_common::crypto::sign::Cipher;
use tuf_ota_common::RoleType;

/// Data structure to parse/store repository configurations
///
/// ```yaml
/// out: ./repository
/// app_name: app
/// roles:
///   root: { threshold: 2, keys: [{ kind: ed25519 }, { kind: ecdsa }] }
///   targets: { threshold: 1, keys: [{ kind: ed25519 }] }
///   snapshot: { threshold: 1, keys: [{ kind: ecdsa }] }
///   timestamp: { threshold: 1, keys: [{ kind: ed25519 }] }
/// expiry:
///   timestamp: 1day
/// ```
#[derive(Debug, Deserialize)]
pub struct RepoConfig {
    /// key: role, value: role configuration
    pub roles: BTreeMap<RoleType, RoleConfig>,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    /// directory to store the repository in
    pub out: PathBuf,
    #[serde(default = "default_true")]
    pub consistent_snapshot: bool,
    /// prefix of the artifact names, needed to publish patches
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
}

fn default_true() -> bool {
    true
}

fn default_archive_extension() -> String {
    ".tar.gz".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoleConfig {
    pub threshold: u8,
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct KeyConfig {
    pub kind: KeyKind,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Ed25519,
    Ecdsa,
}

impl From<KeyKind> for Cipher {
    fn from(value: KeyKind) -> Self {
        match value {
            KeyKind::Ed25519 => Cipher::Ed25519Dalek,
            KeyKind::Ecdsa => Cipher::Ecdsa,
        }
    }
}

/// Lifetimes of newly signed metadata, human readable like `7days`. Missing roles use the
/// [ExpiryPolicy] defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub root: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub targets: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub snapshot: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timestamp: Option<Duration>,
}

/// function to handle [[serde]] deserialization for human readable durations
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    humantime::parse_duration(&buf)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

impl RepoConfig {
    pub fn role_setups(&self) -> Result<BTreeMap<RoleType, RoleSetup>> {
        RoleType::ALL
            .into_iter()
            .map(|role| {
                let config = self
                    .roles
                    .get(&role)
                    .ok_or_else(|| anyhow!("missing configuration for role `{role}`"))?;
                let setup = RoleSetup {
                    threshold: config.threshold,
                    keys: config.keys.iter().map(|k| k.kind.into()).collect(),
                };
                Ok((role, setup))
            })
            .collect()
    }

    pub fn role_setup(&self, role: RoleType) -> Result<RoleSetup> {
        self.role_setups()?
            .remove(&role)
            .ok_or_else(|| anyhow!("missing configuration for role `{role}`"))
    }

    pub fn expiry_policy(&self) -> Result<ExpiryPolicy> {
        let defaults = ExpiryPolicy::default();
        let lifetime = |configured: Option<Duration>, default: chrono::Duration| {
            configured.map_or(Ok(default), |d| {
                chrono::Duration::from_std(d).map_err(|e| anyhow!("invalid expiry {d:?}: {e}"))
            })
        };
        Ok(ExpiryPolicy {
            root: lifetime(self.expiry.root, defaults.root)?,
            targets: lifetime(self.expiry.targets, defaults.targets)?,
            snapshot: lifetime(self.expiry.snapshot, defaults.snapshot)?,
            timestamp: lifetime(self.expiry.timestamp, defaults.timestamp)?,
        })
    }

    /// Version in an artifact name `{app_name}-{version}{archive_extension}`.
    pub fn artifact_version(&self, name: &str) -> Result<semver::Version> {
        let app = self
            .app_name
            .as_deref()
            .ok_or_else(|| anyhow!("`app_name` must be configured to publish patches"))?;
        name.strip_prefix(app)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(self.archive_extension.as_str()))
            .ok_or_else(|| {
                anyhow!("`{name}` is not named `{app}-<version>{}`", self.archive_extension)
            })?
            .parse()
            .map_err(|e| anyhow!("invalid version in `{name}`: {e}"))
    }
}

#[cfg(test)]
mod test {
    use super::RepoConfig;
    use tuf_ota_common::crypto::sign::Cipher;
    use tuf_ota_common::RoleType;

    const CONFIG: &str = r#"
out: ./repository
app_name: app
roles:
  root: { threshold: 2, keys: [{ kind: ed25519 }, { kind: ecdsa }] }
  targets: { threshold: 1, keys: [{ kind: ed25519 }] }
  snapshot: { threshold: 1, keys: [{ kind: ecdsa }] }
  timestamp: { threshold: 1, keys: [{ kind: ed25519 }] }
expiry:
  timestamp: 2h
"#;

    #[test]
    fn test_parse_config() {
        let config: RepoConfig = serde_yaml::from_str(CONFIG).unwrap();
        assert!(config.consistent_snapshot);
        let setups = config.role_setups().unwrap();
        assert_eq!(setups[&RoleType::Root].threshold, 2);
        assert_eq!(
            setups[&RoleType::Root].keys,
            vec![Cipher::Ed25519Dalek, Cipher::Ecdsa]
        );
        let expiry = config.expiry_policy().unwrap();
        assert_eq!(expiry.timestamp, chrono::Duration::hours(2));
        assert_eq!(expiry.root, chrono::Duration::days(365));
    }

    #[test]
    fn test_missing_role() {
        let config: RepoConfig = serde_yaml::from_str(
            r#"
out: ./repository
roles:
  root: { threshold: 1, keys: [{ kind: ed25519 }] }
"#,
        )
        .unwrap();
        assert!(config.role_setups().is_err());
    }

    #[test]
    fn test_artifact_version() {
        let config: RepoConfig = serde_yaml::from_str(CONFIG).unwrap();
        assert_eq!(
            config.artifact_version("app-1.2.3-rc.1.tar.gz").unwrap(),
            semver::Version::parse("1.2.3-rc.1").unwrap()
        );
        assert!(config.artifact_version("other-1.2.3.tar.gz").is_err());
        assert!(config.artifact_version("app-1.2.3.zip").is_err());
    }
}

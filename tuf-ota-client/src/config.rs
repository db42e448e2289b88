use crate::error::UpdateError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Name of the file in the data directory that overrides the configured update URL.
pub const DYNAMIC_CONFIG_FILE: &str = "dynamic_update_config.json";
/// Name of the file inside a freshly installed version that may announce a new update server.
pub const SERVER_CONFIG_FILE: &str = "server_config.json";

/// Data structure to configure the update client, usually read from a YAML file.
///
/// ```yaml
/// app_name: app
/// current_version: 1.0.0
/// update_url: https://updates.example.net/
/// platform: linux-x86_64
/// install_dir: /opt/app
/// data_dir: /var/lib/app-updater
/// initial_root: /etc/app/1.root.json
/// interval: 1h
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// prefix of the artifact names, artifacts are named `{app_name}-{version}{archive_extension}`
    pub app_name: String,
    /// version that is assumed when the install dir does not carry a version marker
    pub current_version: semver::Version,
    /// base URL of the update server, `metadata/` and `targets/` are resolved against it
    pub update_url: Url,
    /// optional path segment inserted after `update_url`
    #[serde(default)]
    pub platform: Option<String>,
    pub install_dir: PathBuf,
    /// holds trusted metadata, downloads and backups
    pub data_dir: PathBuf,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
    #[serde(
        default = "default_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(default)]
    pub auto_update: bool,
    /// use patches when the repository offers one for the installed version
    #[serde(default = "default_true")]
    pub incremental: bool,
    #[serde(default)]
    pub file_watcher: bool,
    #[serde(default)]
    pub watch_dir: Option<PathBuf>,
    #[serde(
        default = "default_request_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_retry_base_delay",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_base_delay: Duration,
    #[serde(default = "default_max_root_rotations")]
    pub max_root_rotations: u32,
    /// root metadata that is trusted out of band, only read when the data dir has no root yet
    pub initial_root: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_archive_extension() -> String {
    ".tar.gz".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_root_rotations() -> u32 {
    32
}

/// function to handle [[serde]] serialization for human readable durations
fn serialize_duration<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// function to handle [[serde]] deserialization for human readable durations like `30s` or `1h`
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = String::deserialize(deserializer)?;
    parse_duration(&buf).map_err(serde::de::Error::custom)
}

/// Accepts humantime durations and plain numbers of seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration `{s}`: {e}"))
}

impl ClientConfig {
    /// Reads the YAML file at `path` and applies `TUF_OTA_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        let data = std::fs::read_to_string(path).map_err(UpdateError::io(path))?;
        let mut config: ClientConfig = serde_yaml::from_str(&data)
            .map_err(|e| UpdateError::Config(format!("failed to parse {path:?}: {e}")))?;
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Applies environment overrides, variables without the `TUF_OTA_` prefix are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), UpdateError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let invalid = |name: &str, value: &str| {
            UpdateError::Config(format!("invalid value `{value}` for {name}"))
        };
        for (name, value) in vars {
            let Some(key) = name.strip_prefix("TUF_OTA_") else {
                continue;
            };
            debug!("applying environment override {name}");
            match key {
                "UPDATE_URL" => {
                    self.update_url = Url::parse(&value).map_err(|_| invalid(&name, &value))?
                }
                "UPDATE_INTERVAL" => {
                    self.interval = parse_duration(&value).map_err(UpdateError::Config)?
                }
                "AUTO_UPDATE" => self.auto_update = parse_bool(&value),
                "INCREMENTAL_UPDATE" => self.incremental = parse_bool(&value),
                "FILE_WATCHER" => self.file_watcher = parse_bool(&value),
                "REQUEST_TIMEOUT" => {
                    self.request_timeout = parse_duration(&value).map_err(UpdateError::Config)?
                }
                "MAX_RETRIES" => {
                    self.max_retries = value.parse().map_err(|_| invalid(&name, &value))?
                }
                "LOG_LEVEL" => self.log_level = Some(value),
                "APP_NAME" => self.app_name = value,
                "CURRENT_VERSION" => {
                    self.current_version = value.parse().map_err(|_| invalid(&name, &value))?
                }
                _ => warn!("ignoring unknown environment variable {name}"),
            }
        }
        Ok(())
    }

    /// Base URL for this client: the dynamic override if present, else `update_url`, plus the
    /// platform segment.
    pub fn base_url(&self) -> Result<Url, UpdateError> {
        let base = match DynamicConfig::load(&self.data_dir)? {
            Some(dynamic) => {
                debug!("using dynamic update url {}", dynamic.update_server_url);
                dynamic.update_server_url
            }
            None => self.update_url.clone(),
        };
        let base = with_trailing_slash(base);
        match &self.platform {
            Some(platform) => base
                .join(&format!("{}/", platform.trim_matches('/')))
                .map_err(|e| UpdateError::Config(format!("invalid platform `{platform}`: {e}"))),
            None => Ok(base),
        }
    }

    pub fn metadata_url(&self) -> Result<Url, UpdateError> {
        self.base_url()?
            .join("metadata/")
            .map_err(|e| UpdateError::Config(e.to_string()))
    }

    pub fn targets_url(&self) -> Result<Url, UpdateError> {
        self.base_url()?
            .join("targets/")
            .map_err(|e| UpdateError::Config(e.to_string()))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("downloads")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("backups")
    }

    /// Holds the archive of the installed version, used as base for patches.
    pub fn installed_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("installed")
    }

    /// One lock per installation directory, next to it like the staging directories.
    pub fn lock_path(&self) -> PathBuf {
        crate::install::sibling(&self.install_dir, "lock")
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true") || value.trim() == "1"
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Update server override written by the client itself, kept in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynamicConfig {
    pub update_server_url: Url,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub current_version: Option<String>,
}

impl DynamicConfig {
    pub fn load(data_dir: &Path) -> Result<Option<Self>, UpdateError> {
        let path = data_dir.join(DYNAMIC_CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).map_err(UpdateError::io(&path))?;
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| UpdateError::Config(format!("failed to parse {path:?}: {e}")))
    }

    pub fn store(&self, data_dir: &Path) -> Result<(), UpdateError> {
        let path = data_dir.join(DYNAMIC_CONFIG_FILE);
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| UpdateError::Config(format!("failed to encode {path:?}: {e}")))?;
        crate::storage::write_atomic(&path, &data)
    }
}

/// Contents of [SERVER_CONFIG_FILE] shipped inside an update.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServerConfig {
    pub update_server_url: Url,
}

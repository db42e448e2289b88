use crate::config::{ClientConfig, DynamicConfig, ServerConfig, SERVER_CONFIG_FILE};
use crate::download::{self, DownloadJob, ProgressFn, VerifiedFile};
use crate::error::UpdateError;
use crate::events::{EventBus, UpdateEvent};
use crate::install::{self, ArchiveInstaller, CleanupReport, Installer, RecoveryAction};
use crate::patch::{apply_patch, find_patch};
use crate::session::{SessionLock, SessionState, UpdateSession, VersionInfo};
use crate::storage::FilesystemStorage;
use crate::transport;
use crate::watcher::FileWatcher;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tuf_ota::refresh::{Refresher, TrustedSet};
use tuf_ota_common::remote::TufTransport;
use tuf_ota_common::TufError;
use tuf_ota_json::targets::{TargetFile, Targets};

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of [UpdateController::start_update].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// nothing newer than the installed version was published
    UpToDate { version: semver::Version },
    /// the new version is in place, the application has to be restarted to use it
    Installed {
        version: semver::Version,
        patched: bool,
    },
}

/// Drives update sessions for one installation: refreshes the trusted metadata, picks the
/// newest artifact, downloads and verifies it, and installs it with a backup to roll back to.
///
/// The controller never restarts the application, a successful session ends in
/// [SessionState::RestartPending].
pub struct UpdateController {
    config: ClientConfig,
    refresher: Refresher<FilesystemStorage>,
    transport: Arc<dyn TufTransport>,
    installer: Arc<dyn Installer>,
    events: EventBus,
    state: Arc<Mutex<SessionState>>,
    session: Mutex<Option<UpdateSession>>,
    cancel: Arc<AtomicBool>,
}

impl UpdateController {
    /// Creates a controller that fetches from the configured update URL.
    pub fn new(config: ClientConfig) -> Result<Self, UpdateError> {
        let transport = transport::from_config(&config)?;
        Self::with_transport(config, transport)
    }

    /// Creates a controller with a custom transport. Interrupted installations are recovered
    /// unless another session holds the lock.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn TufTransport>,
    ) -> Result<Self, UpdateError> {
        let storage = FilesystemStorage::open(&config.metadata_dir(), &config.initial_root)?;
        let refresher = Refresher::new(storage, config.max_root_rotations)?;
        let controller = UpdateController {
            config,
            refresher,
            transport,
            installer: Arc::new(ArchiveInstaller),
            events: EventBus::default(),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            session: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        match controller.recover() {
            Ok(_) | Err(UpdateError::SessionAlreadyInProgress) => {}
            Err(e) => return Err(e),
        }
        Ok(controller)
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The running or last update session.
    pub fn session(&self) -> Option<UpdateSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn trusted(&self) -> Arc<TrustedSet> {
        self.refresher.trusted()
    }

    /// Version in the install directory, or the configured version if it carries no marker.
    pub fn installed_version(&self) -> semver::Version {
        install::read_installed_version(&self.config.install_dir, &self.config.current_version)
    }

    /// Asks a running session to stop. Honored until installing begins.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, next: SessionState) -> Result<(), UpdateError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        crate::session::transition(state.phase(), next.phase())?;
        debug!("session state {:?} -> {:?}", state.phase(), next.phase());
        *state = next;
        Ok(())
    }

    fn update_session(&self, f: impl FnOnce(&mut UpdateSession)) {
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            f(session);
        }
    }

    fn check_cancelled(&self) -> Result<(), UpdateError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    fn lock(&self) -> Result<SessionLock, UpdateError> {
        SessionLock::try_acquire(&self.config.lock_path())
    }

    /// Refreshes the trusted metadata and reports the newest published version if it is newer
    /// than the installed one.
    pub async fn check_for_update(&self) -> Result<Option<VersionInfo>, UpdateError> {
        let _lock = self.lock()?;
        self.check().await
    }

    async fn check(&self) -> Result<Option<VersionInfo>, UpdateError> {
        self.set_state(SessionState::Checking)?;
        match self.check_inner().await {
            Ok(Some(info)) => {
                self.set_state(SessionState::UpdateAvailable(info.clone()))?;
                Ok(Some(info))
            }
            Ok(None) => {
                self.set_state(SessionState::UpToDate {
                    version: self.installed_version(),
                })?;
                Ok(None)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn check_inner(&self) -> Result<Option<VersionInfo>, UpdateError> {
        self.events.send(UpdateEvent::RefreshStarted);
        let report = self
            .refresher
            .refresh(self.transport.as_ref(), &Utc::now())
            .await?;
        for (from, to) in &report.rotations {
            self.events.send(UpdateEvent::RootRotated {
                from: *from,
                to: *to,
            });
        }
        let trusted = self.refresher.trusted();
        let targets = trusted.targets().ok_or(TufError::MissingTargetsFile)?;
        let installed = self.installed_version();
        let Some((version, metapath, target)) = latest_version(
            targets,
            &self.config.app_name,
            &self.config.archive_extension,
        ) else {
            info!("no artifacts published for {}", self.config.app_name);
            return Ok(None);
        };
        if version <= installed {
            info!("installed version {installed} is up to date");
            return Ok(None);
        }
        let patch = if self.config.incremental {
            find_patch(targets, &self.config.app_name, &installed, &version)
                .filter(|(_, patch)| patch.length < target.length)
                .map(|(name, _)| name)
        } else {
            None
        };
        info!("update available: {installed} -> {version}");
        self.events.send(UpdateEvent::UpdateAvailable {
            version: version.clone(),
        });
        Ok(Some(VersionInfo {
            version,
            length: target.length,
            metapath,
            patch,
        }))
    }

    /// Runs a complete update session. `progress` receives `(downloaded, total)` from the
    /// download task.
    pub async fn start_update(
        &self,
        progress: Option<ProgressFn>,
    ) -> Result<UpdateOutcome, UpdateError> {
        let _lock = self.lock()?;
        self.cancel.store(false, Ordering::SeqCst);
        let installed = self.installed_version();
        let Some(info) = self.check().await? else {
            return Ok(UpdateOutcome::UpToDate { version: installed });
        };
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(UpdateSession::new(installed, info.clone()));

        match self.run_session(&info, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(UpdateError::Cancelled) => {
                info!("update to {} cancelled", info.version);
                self.set_state(SessionState::Idle)?;
                Err(UpdateError::Cancelled)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Moves to [SessionState::Failed] unless the session already ended.
    fn fail(&self, e: &UpdateError) {
        error!("update session failed: {e}");
        if self.state().phase().is_final() {
            return;
        }
        if let Err(e) = self.set_state(SessionState::Failed {
            reason: e.to_string(),
        }) {
            warn!("{e}");
        }
    }

    async fn run_session(
        &self,
        info: &VersionInfo,
        progress: Option<ProgressFn>,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.check_cancelled()?;
        let trusted = self.refresher.trusted();
        let full = trusted.target(&info.metapath)?.clone();

        let artifact = match self.try_patch(&trusted, info, &full, progress.clone()).await {
            Ok(Some(path)) => path,
            Ok(None) => self.download_full(info, &full, progress).await?,
            Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
            Err(e) => {
                warn!("incremental update failed, downloading full artifact: {e}");
                self.download_full(info, &full, progress).await?
            }
        };

        self.check_cancelled()?;
        self.set_state(SessionState::BackingUp)?;
        let installed = self.installed_version();
        let install_dir = self.config.install_dir.clone();
        let backups_dir = self.config.backups_dir();
        let backup = blocking(move || install::backup(&install_dir, &backups_dir, &installed))
            .await?;
        self.update_session(|s| s.backup_path = Some(backup.clone()));

        self.check_cancelled()?;
        self.set_state(SessionState::Installing)?;
        self.install(info, &artifact, &backup).await
    }

    /// Fetches the patch from the installed version and applies it to the cached archive.
    /// `Ok(None)` means no patch applies.
    async fn try_patch(
        &self,
        trusted: &TrustedSet,
        info: &VersionInfo,
        full: &TargetFile,
        progress: Option<ProgressFn>,
    ) -> Result<Option<PathBuf>, UpdateError> {
        let Some(patch_path) = &info.patch else {
            return Ok(None);
        };
        let base = self.installed_artifact_path(&self.installed_version());
        if !base.exists() {
            debug!("no cached artifact at {base:?}, skipping patch");
            return Ok(None);
        }
        let patch_target = trusted.target(patch_path)?.clone();
        let patch = self.download(patch_path, patch_target, progress).await?;

        self.set_state(SessionState::Patching)?;
        let limit = full.length;
        let patched = blocking(move || {
            let old = std::fs::read(&base).map_err(UpdateError::io(&base))?;
            let data = std::fs::read(&patch.path).map_err(UpdateError::io(&patch.path))?;
            let _ = std::fs::remove_file(&patch.path);
            apply_patch(&old, &data, limit).map_err(|e| UpdateError::IntegrityFailure {
                metapath: patch.metapath.clone(),
                reason: format!("failed to apply patch: {e}"),
            })
        })
        .await?;

        self.set_state(SessionState::Verifying)?;
        download::verify_bytes(&info.metapath, full, &patched)?;
        let path = download::part_path(&self.config.downloads_dir(), &info.metapath);
        crate::storage::write_atomic(&path, &patched)?;
        self.update_session(|s| {
            s.patched = true;
            s.verified = true;
        });
        info!("applied patch {patch_path}");
        Ok(Some(path))
    }

    async fn download_full(
        &self,
        info: &VersionInfo,
        full: &TargetFile,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, UpdateError> {
        let file = self
            .download(&info.metapath, full.clone(), progress)
            .await?;
        self.update_session(|s| s.verified = true);
        Ok(file.path)
    }

    /// Downloads and verifies `metapath` in a separate task, ending in [SessionState::Verifying].
    async fn download(
        &self,
        metapath: &str,
        expected: TargetFile,
        progress: Option<ProgressFn>,
    ) -> Result<VerifiedFile, UpdateError> {
        let total = expected.length;
        self.set_state(SessionState::Downloading {
            downloaded: 0,
            total,
        })?;
        let observer: ProgressFn = {
            let events = self.events.clone();
            let state = self.state.clone();
            Arc::new(move |downloaded, total| {
                *state.lock().unwrap_or_else(PoisonError::into_inner) =
                    SessionState::Downloading { downloaded, total };
                events.send(UpdateEvent::DownloadProgress { downloaded, total });
                if let Some(progress) = &progress {
                    progress(downloaded, total);
                }
            })
        };
        let job = DownloadJob {
            transport: self.transport.clone(),
            metapath: metapath.to_string(),
            expected,
            dir: self.config.downloads_dir(),
            chunk_timeout: self.config.request_timeout,
            max_retries: self.config.max_retries,
            cancel: self.cancel.clone(),
            progress: Some(observer),
        };
        let file = download::spawn(job)
            .await
            .map_err(|e| UpdateError::InstallFailure(format!("download task failed: {e}")))??;
        self.update_session(|s| s.downloaded_bytes += file.length);
        self.set_state(SessionState::Verifying)?;
        Ok(file)
    }

    async fn install(
        &self,
        info: &VersionInfo,
        artifact: &Path,
        backup: &Path,
    ) -> Result<UpdateOutcome, UpdateError> {
        let installed = self.installed_version();
        let result = {
            let installer = self.installer.clone();
            let artifact = artifact.to_path_buf();
            let metapath = info.metapath.clone();
            let install_dir = self.config.install_dir.clone();
            let version = info.version.clone();
            blocking(move || {
                install::install(
                    installer.as_ref(),
                    &artifact,
                    &metapath,
                    &install_dir,
                    &version,
                )?;
                installer.post_install(&install_dir)
            })
            .await
        };

        if let Err(e) = result {
            let reason = e.to_string();
            self.events.send(UpdateEvent::InstallFailed {
                reason: reason.clone(),
            });
            let backup = backup.to_path_buf();
            let install_dir = self.config.install_dir.clone();
            let restored = blocking(move || install::restore(&backup, &install_dir)).await;
            if let Err(restore_err) = restored {
                let reason = format!("{reason}, restoring the backup failed: {restore_err}");
                self.set_state(SessionState::Failed {
                    reason: reason.clone(),
                })?;
                return Err(UpdateError::InstallFailure(reason));
            }
            warn!("installation of {} failed, rolled back to {installed}", info.version);
            self.set_state(SessionState::RolledBack {
                version: installed.clone(),
                reason: reason.clone(),
            })?;
            self.events.send(UpdateEvent::RolledBack {
                to_version: installed,
            });
            return Err(UpdateError::InstallFailure(reason));
        }

        self.cache_installed_artifact(artifact, &info.version);
        self.apply_server_config(&info.version);
        self.set_state(SessionState::RestartPending {
            version: info.version.clone(),
        })?;
        self.events.send(UpdateEvent::InstallSucceeded {
            version: info.version.clone(),
        });
        let patched = self.session().map(|s| s.patched).unwrap_or(false);
        info!("update to {} installed, restart pending", info.version);
        Ok(UpdateOutcome::Installed {
            version: info.version.clone(),
            patched,
        })
    }

    fn installed_artifact_path(&self, version: &semver::Version) -> PathBuf {
        self.config.installed_cache_dir().join(format!(
            "{}-{version}{}",
            self.config.app_name, self.config.archive_extension
        ))
    }

    /// Keeps the installed artifact as base for the next patch, replacing older ones.
    fn cache_installed_artifact(&self, artifact: &Path, version: &semver::Version) {
        let dir = self.config.installed_cache_dir();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.filter_map(Result::ok) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        let dest = self.installed_artifact_path(version);
        let cached = std::fs::create_dir_all(&dir).and_then(|_| std::fs::rename(artifact, &dest));
        if let Err(e) = cached {
            warn!("failed to cache installed artifact: {e}");
        }
    }

    /// Picks up a `server_config.json` shipped with the new version.
    fn apply_server_config(&self, version: &semver::Version) {
        let path = self.config.install_dir.join(SERVER_CONFIG_FILE);
        let Ok(data) = std::fs::read(&path) else {
            return;
        };
        let server_config = match serde_json::from_slice::<ServerConfig>(&data) {
            Ok(server_config) => server_config,
            Err(e) => {
                warn!("ignoring invalid {path:?}: {e}");
                return;
            }
        };
        let dynamic = DynamicConfig {
            update_server_url: server_config.update_server_url,
            app_name: Some(self.config.app_name.clone()),
            current_version: Some(version.to_string()),
        };
        match dynamic.store(&self.config.data_dir) {
            Ok(()) => info!("update server changed to {}", dynamic.update_server_url),
            Err(e) => warn!("failed to store dynamic update config: {e}"),
        }
    }

    /// Removes partial downloads and all backups but the newest.
    pub fn cleanup(&self) -> Result<CleanupReport, UpdateError> {
        let _lock = self.lock()?;
        install::cleanup(&self.config.downloads_dir(), &self.config.backups_dir())
    }

    /// Completes or reverts an installation that was interrupted by a crash.
    pub fn recover(&self) -> Result<RecoveryAction, UpdateError> {
        let _lock = self.lock()?;
        install::recover(&self.config.install_dir)
    }

    /// Checks for updates every `interval` and on file watcher triggers, installing them when
    /// `auto_update` is set. Returns once an update was installed.
    pub async fn run(&self) -> Result<UpdateOutcome, UpdateError> {
        let (_watcher, mut triggers) = match (self.config.file_watcher, &self.config.watch_dir) {
            (true, Some(dir)) => {
                let (watcher, triggers) = FileWatcher::spawn(dir.clone(), WATCH_POLL_INTERVAL);
                (Some(watcher), Some(triggers))
            }
            (true, None) => {
                warn!("file watcher enabled without watch_dir");
                (None, None)
            }
            _ => (None, None),
        };
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => debug!("periodic update check"),
                Some(()) = next_trigger(&mut triggers) => info!("file change detected"),
            }
            let result = if self.config.auto_update {
                self.start_update(None).await.map(Some)
            } else {
                self.check_for_update().await.map(|_| None)
            };
            match result {
                Ok(Some(outcome @ UpdateOutcome::Installed { .. })) => return Ok(outcome),
                Ok(_) => {}
                Err(UpdateError::SessionAlreadyInProgress) => {
                    debug!("skipping check, another session is running")
                }
                Err(e @ UpdateError::Tuf(TufError::TooManyRootRotations { .. })) => return Err(e),
                Err(e) if e.is_retryable() => warn!("update check failed, will retry: {e}"),
                Err(e) => error!("update check failed: {e}"),
            }
        }
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match triggers {
        Some(triggers) => triggers.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs blocking filesystem work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, UpdateError>
where
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::InstallFailure(format!("blocking task failed: {e}")))?
}

/// Newest artifact named `{app}-{version}{extension}`, patches are not considered.
pub fn latest_version<'t>(
    targets: &'t Targets,
    app: &str,
    extension: &str,
) -> Option<(semver::Version, String, &'t TargetFile)> {
    let prefix = format!("{app}-");
    targets
        .targets
        .iter()
        .filter(|(name, _)| !name.starts_with("patches/"))
        .filter_map(|(name, target)| {
            let version = name
                .strip_prefix(&prefix)?
                .strip_suffix(extension)?
                .parse::<semver::Version>()
                .ok()?;
            Some((version, name.clone(), target))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
}

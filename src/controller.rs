//! The update-controller state machine: ties the fetcher, manifest
//! verification, hash/size checks, and the host's [`Installer`] together
//! into `checkForUpdates` → `download` → `quitAndInstall`, plus a periodic
//! polling loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use semver::Version;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ManifestSource, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::fetcher::Fetcher;
use crate::hasher;
use crate::installer::{Installer, OnShutdown, ProcessExitOnShutdown};
use crate::manifest::Manifest;
use crate::platform;
use crate::signer::PublicKey;
use crate::sizer;
use crate::update_info::UpdateInfo;

/// Shortest interval `check_periodically` will honor; anything shorter is
/// clamped up to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Interval `check_periodically` uses when none is supplied.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10 * 60 * 60);

/// Where the controller believes itself to be. Transitions are driven
/// entirely by `checkForUpdates`/`download`/`scheduleInstallOnQuit`; nothing
/// here is timer-driven on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Checking,
    UpdateAvailable,
    Downloading,
    ReadyToInstall,
    InstallScheduled,
    Failed,
}

/// Notifications emitted as the controller progresses, delivered over the
/// channel returned alongside the controller by [`ControllerBuilder::build`].
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    CheckStarted,
    NoUpdateAvailable,
    UpdateAvailable { version: Version },
    CheckFailed { message: String },
    DownloadStarted { version: Version },
    DownloadComplete { path: PathBuf },
    DownloadFailed { message: String },
    InstallScheduled { path: PathBuf },
}

/// Drives the self-update lifecycle for one application instance.
pub struct UpdateController {
    config: UpdaterConfig,
    fetcher: Fetcher,
    public_keys: Vec<PublicKey>,
    installer: Arc<dyn Installer>,
    state: Mutex<ControllerState>,
    events: mpsc::UnboundedSender<UpdateEvent>,
    periodic_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    checking: Arc<AtomicBool>,
    downloading: AtomicBool,
    downloaded_file: StdMutex<Option<PathBuf>>,
    pending_install: StdMutex<Option<(PathBuf, bool)>>,
    on_shutdown: Arc<dyn OnShutdown>,
    exit_hook_armed: AtomicBool,
}

impl UpdateController {
    /// Start a [`ControllerBuilder`].
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ControllerState {
        *self.state.lock().await
    }

    /// Fetch and verify a manifest from the first configured source that
    /// resolves, and compare its version against the running application's.
    /// Returns `Ok(None)` if the resolved manifest is not newer.
    ///
    /// If a newer manifest is found and no download is already in flight and
    /// no file has been downloaded yet, a `download` of it is started
    /// concurrently in the background (spec.md §4.G); its outcome surfaces
    /// through the event channel (`DownloadStarted`/`DownloadComplete`/
    /// `DownloadFailed`), not through this call's return value.
    pub async fn check_for_updates(self: &Arc<Self>) -> Result<Option<Manifest>> {
        *self.state.lock().await = ControllerState::Checking;
        let _ = self.events.send(UpdateEvent::CheckStarted);

        let manifest = match self.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                *self.state.lock().await = ControllerState::Failed;
                let _ = self.events.send(UpdateEvent::CheckFailed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        if manifest.is_newer_version_than(&self.config.version) {
            *self.state.lock().await = ControllerState::UpdateAvailable;
            let _ = self.events.send(UpdateEvent::UpdateAvailable {
                version: manifest.version(),
            });

            let already_downloading = self.downloading.load(Ordering::SeqCst);
            let already_downloaded = self.downloaded_file.lock().expect("mutex poisoned").is_some();
            if !already_downloading && !already_downloaded {
                let controller = Arc::clone(self);
                let manifest_to_download = manifest.clone();
                tokio::spawn(async move {
                    let _ = controller.download(&manifest_to_download).await;
                });
            }

            Ok(Some(manifest))
        } else {
            *self.state.lock().await = ControllerState::Idle;
            let _ = self.events.send(UpdateEvent::NoUpdateAvailable);
            Ok(None)
        }
    }

    async fn fetch_manifest(&self) -> Result<Manifest> {
        let mut last_error = None;
        for source in &self.config.manifests {
            let attempt = match source {
                ManifestSource::Url(url) => self.fetch_manifest_from_url(url).await,
                ManifestSource::GitHubRepo { owner, repo } => {
                    self.fetch_manifest_from_github(owner, repo).await
                }
            };
            match attempt {
                Ok(manifest) => return Ok(manifest),
                Err(e) => {
                    warn!(source = ?source, error = %e, "manifest source failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            UpdaterError::ConfigInvalid("no manifest sources configured".to_string())
        }))
    }

    async fn fetch_manifest_from_url(&self, url: &str) -> Result<Manifest> {
        let text = self.fetcher.fetch_text(url, None).await?;
        Manifest::load_from_string(&self.public_keys, &text)
    }

    /// Resolve a `github:owner/repo` manifest source: fetch every release
    /// page, keep the eligible ones (not draft; prerelease only when
    /// `nightly`/`allow_prerelease` is set), and pick the single release
    /// whose `tag_name` is the semver-greatest among them — per `spec.md`
    /// §4.G this is a selection by version, not by API response order
    /// (GitHub's `/releases` list is sorted by creation time, which is not
    /// always the same as semver order once backports exist).
    async fn fetch_manifest_from_github(&self, owner: &str, repo: &str) -> Result<Manifest> {
        let releases_url = format!("https://api.github.com/repos/{owner}/{repo}/releases?per_page=30");
        let pages = self.fetcher.fetch_all_json_pages(&releases_url).await?;
        let allow_prerelease = self.config.nightly || self.config.allow_prerelease;

        let release = select_newest_eligible_release(&pages, allow_prerelease, &self.config.version)
            .ok_or_else(|| {
                UpdaterError::NotFound(format!(
                    "no release in {owner}/{repo} is newer than {}",
                    self.config.version
                ))
            })?;
        let tag_name = release
            .get("tag_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let assets = release
            .get("assets")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                UpdaterError::NotFound(format!("release {tag_name} in {owner}/{repo} has no assets"))
            })?;
        let asset = assets
            .iter()
            .find(|a| a.get("name").and_then(Value::as_str) == Some("manifest.txt"))
            .ok_or_else(|| {
                UpdaterError::NotFound(format!(
                    "release {tag_name} in {owner}/{repo} has no manifest.txt asset"
                ))
            })?;
        let download_url = asset
            .get("browser_download_url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                UpdaterError::NotFound(format!(
                    "manifest.txt asset for {tag_name} in {owner}/{repo} has no download URL"
                ))
            })?;

        debug!(owner, repo, download_url, tag_name, "found release manifest asset");
        let text = self.fetcher.fetch_text(download_url, None).await?;
        Manifest::load_from_string(&self.public_keys, &text)
    }

    /// Download, size-check, and hash-verify the artifact for the host
    /// platform described by `manifest`, recording attempts via
    /// [`UpdateInfo`] so a crash mid-download is visible on the next launch.
    ///
    /// `downloading` acts as a mutex: a call made while another download is
    /// already in flight on this controller fails fast with
    /// [`UpdaterError::DownloadInProgress`] instead of racing it.
    ///
    /// On success, if `auto_install` is set in the controller's
    /// configuration, the exit hook is armed automatically (spec.md §4.G);
    /// otherwise the embedder must call `schedule_install_on_quit` itself.
    pub async fn download(self: &Arc<Self>, manifest: &Manifest) -> Result<PathBuf> {
        if self.downloading.swap(true, Ordering::SeqCst) {
            return Err(UpdaterError::DownloadInProgress);
        }

        *self.state.lock().await = ControllerState::Downloading;
        let _ = self.events.send(UpdateEvent::DownloadStarted {
            version: manifest.version(),
        });

        let result = self.download_inner(manifest).await;

        match &result {
            Ok(path) => {
                *self.downloaded_file.lock().expect("mutex poisoned") = Some(path.clone());
                *self.state.lock().await = ControllerState::ReadyToInstall;
                let _ = self.events.send(UpdateEvent::DownloadComplete {
                    path: path.clone(),
                });
                if self.config.auto_install {
                    if let Err(e) = self.arm_for_install(path.clone(), false).await {
                        warn!(error = %e, "failed to arm exit hook after auto_install download");
                    }
                }
            }
            Err(e) => {
                *self.state.lock().await = ControllerState::Failed;
                let _ = self.events.send(UpdateEvent::DownloadFailed {
                    message: e.to_string(),
                });
            }
        }

        self.downloading.store(false, Ordering::SeqCst);
        result
    }

    async fn download_inner(&self, manifest: &Manifest) -> Result<PathBuf> {
        let platform_key = platform::host_platform_key()?;
        if !manifest.has_platform(&platform_key) {
            return Err(UpdaterError::NoPlatformFile(platform_key));
        }

        let url = manifest
            .file(&platform_key)
            .ok_or_else(|| UpdaterError::NoPlatformFile(platform_key.clone()))?
            .to_string();
        let size = manifest
            .size(&platform_key)
            .ok_or_else(|| UpdaterError::NoPlatformFile(platform_key.clone()))?;
        let sha512 = manifest
            .sha512(&platform_key)
            .ok_or_else(|| UpdaterError::NoPlatformFile(platform_key.clone()))?
            .to_string();

        tokio::fs::create_dir_all(&self.config.downloads_directory).await?;
        let temp_file_name = format!("peerio-update-{}.tmp", random_temp_suffix());

        let previous_attempts = UpdateInfo::load(&self.config.downloads_directory)
            .await?
            .map(|info| info.attempts)
            .unwrap_or(0);

        let info = UpdateInfo {
            attempts: previous_attempts + 1,
            current_version: self.config.version.to_string(),
            update_version: manifest.version().to_string(),
            update_size: size,
            update_hash: sha512.clone(),
            update_file: temp_file_name.clone(),
        };
        info.save(&self.config.downloads_directory).await?;

        let destination = info.artifact_path(&self.config.downloads_directory);
        self.fetcher.fetch_file(&url, &destination).await?;

        if let Err(e) = sizer::verify(size, &destination).await {
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e);
        }
        if let Err(e) = hasher::verify(&sha512, &destination).await {
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e);
        }

        let resolved = UpdateInfo {
            attempts: 0,
            ..info
        };
        resolved.save(&self.config.downloads_directory).await?;

        Ok(destination)
    }

    /// Whether the previous run recorded an install attempt whose
    /// `currentVersion` still matches the version running right now, meaning
    /// the install never actually took effect (crash, kill, or installer
    /// failure mid-update).
    pub async fn did_last_update_fail(&self) -> Result<bool> {
        Ok(UpdateInfo::load(&self.config.downloads_directory)
            .await?
            .map(|info| info.did_last_update_fail(&self.config.version))
            .unwrap_or(false))
    }

    /// Discard any in-progress download record and its partial artifact.
    pub async fn cleanup(&self) -> Result<()> {
        if let Some(info) = UpdateInfo::load(&self.config.downloads_directory).await? {
            info.cleanup(&self.config.downloads_directory).await?;
        }
        Ok(())
    }

    /// Remember `artifact_path` to be installed the next time the exit hook
    /// fires, without installing immediately: `restart=false`; persist
    /// `UpdateInfo`; arm the exit hook (spec.md §4.G).
    pub async fn schedule_install_on_quit(self: &Arc<Self>, artifact_path: PathBuf) {
        if let Err(e) = self.arm_for_install(artifact_path, false).await {
            warn!(error = %e, "failed to persist UpdateInfo while scheduling install; exit hook still armed");
        }
    }

    /// Install the scheduled (or just-downloaded) artifact and terminate the
    /// process: `restart=true`; persist `UpdateInfo`; arm the exit hook; then
    /// request the host quit immediately rather than waiting for it to quit
    /// on its own (spec.md §4.G). On Linux, [`relaunch_executable_path`] is
    /// logged alongside the install so the host can hand it back to the
    /// relaunched process; the `Installer` contract itself stays exactly
    /// `(path, restart)` per `spec.md` §4.H.
    pub async fn quit_and_install(self: &Arc<Self>, artifact_path: Option<PathBuf>) -> Result<()> {
        let path = self.resolve_install_path(artifact_path).await?;
        self.arm_for_install(path.clone(), true).await?;
        if let Some(exe) = relaunch_executable_path() {
            debug!(executable = %exe.display(), "relaunch executable path available for host");
        }
        self.installer.install(&path, true)?;
        info!(path = %path.display(), "installing update and exiting");
        std::process::exit(0);
    }

    /// Re-attempt installation after a previous attempt failed. If
    /// `allow_local` is true and a previously downloaded artifact is still
    /// present under the downloads directory and still verifies against its
    /// recorded size/hash, it is reused; otherwise a fresh `check_for_updates`
    /// + `download` cycle runs first. On success the process exits exactly
    /// like `quit_and_install`; on installer failure, the attempt already
    /// recorded by arming the exit hook stands, and the error is returned so
    /// the caller can fall back to a plain relaunch instead of losing the
    /// artifact.
    pub async fn quit_and_retry_install(self: &Arc<Self>, allow_local: bool) -> Result<()> {
        let path = if allow_local {
            self.valid_downloaded_artifact().await?
        } else {
            None
        };

        let path = match path {
            Some(path) => path,
            None => {
                let manifest = self
                    .check_for_updates()
                    .await?
                    .ok_or(UpdaterError::NoUpdate)?;
                self.download(&manifest).await?
            }
        };

        self.arm_for_install(path.clone(), true).await?;
        match self.installer.install(&path, true) {
            Ok(()) => {
                info!(path = %path.display(), "installing update and exiting");
                std::process::exit(0);
            }
            Err(e) => Err(e),
        }
    }

    /// Persist an install attempt, record the pending `(path, restart)`, and
    /// arm the exit hook if it isn't armed yet (it installs once). Shared by
    /// `schedule_install_on_quit`, `quit_and_install`, `quit_and_retry_install`,
    /// and `download`'s `auto_install` path.
    async fn arm_for_install(self: &Arc<Self>, artifact_path: PathBuf, restart: bool) -> Result<()> {
        self.persist_install_attempt(&artifact_path).await?;

        *self.pending_install.lock().expect("mutex poisoned") = Some((artifact_path.clone(), restart));
        *self.state.lock().await = ControllerState::InstallScheduled;
        let _ = self
            .events
            .send(UpdateEvent::InstallScheduled { path: artifact_path });

        self.arm_exit_hook();
        Ok(())
    }

    /// Bump the recorded attempt count in `UpdateInfo` just before an install
    /// is attempted. A write failure here must stay non-fatal to
    /// `scheduleInstallOnQuit` per spec.md §5, so this only logs and returns
    /// `Ok` when there's no existing record to bump (arming an install
    /// without a prior successful `download` on this controller instance).
    async fn persist_install_attempt(&self, artifact_path: &Path) -> Result<()> {
        match UpdateInfo::load(&self.config.downloads_directory).await? {
            Some(mut info) => {
                info.attempts += 1;
                info.save(&self.config.downloads_directory).await?;
            }
            None => {
                warn!(
                    path = %artifact_path.display(),
                    "arming install with no prior UpdateInfo record on disk"
                );
            }
        }
        Ok(())
    }

    /// Register the exit hook with [`OnShutdown`] at most once. Later calls
    /// (e.g. `quit_and_install` after `schedule_install_on_quit` already
    /// armed it) are no-ops beyond updating `pending_install`, matching
    /// spec.md §4.G's "installs once".
    fn arm_exit_hook(self: &Arc<Self>) {
        if self.exit_hook_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = Arc::clone(self);
        self.on_shutdown.register(Box::new(move || {
            let pending = controller.pending_install.lock().expect("mutex poisoned").clone();
            let Some((path, restart)) = pending else {
                return;
            };
            if let Err(e) = controller.installer.install(&path, restart) {
                warn!(error = %e, path = %path.display(), "exit-hook install failed");
                return;
            }
            std::process::exit(0);
        }));
    }

    /// A previously downloaded artifact that still exists under the
    /// downloads directory and still verifies against the size/hash recorded
    /// for it in `UpdateInfo`. Refuses anything that resolves outside the
    /// downloads directory, matching the same canonicalization guard
    /// `UpdateInfo::cleanup` uses.
    async fn valid_downloaded_artifact(&self) -> Result<Option<PathBuf>> {
        let Some(info) = UpdateInfo::load(&self.config.downloads_directory).await? else {
            return Ok(None);
        };
        let artifact_path = info.artifact_path(&self.config.downloads_directory);

        let Ok(canonical_dir) = tokio::fs::canonicalize(&self.config.downloads_directory).await else {
            return Ok(None);
        };
        let Ok(canonical_artifact) = tokio::fs::canonicalize(&artifact_path).await else {
            return Ok(None);
        };
        if !canonical_artifact.starts_with(&canonical_dir) {
            return Ok(None);
        }

        if sizer::verify(info.update_size, &artifact_path).await.is_err() {
            return Ok(None);
        }
        if hasher::verify(&info.update_hash, &artifact_path).await.is_err() {
            return Ok(None);
        }

        Ok(Some(artifact_path))
    }

    async fn resolve_install_path(&self, artifact_path: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = artifact_path {
            return Ok(path);
        }
        self.pending_install
            .lock()
            .expect("mutex poisoned")
            .clone()
            .map(|(path, _restart)| path)
            .ok_or(UpdaterError::NothingToInstall)
    }

    /// Begin polling `check_for_updates` every `interval`, or every
    /// [`DEFAULT_INTERVAL`] if `interval` is `None`. Any interval shorter
    /// than [`MIN_INTERVAL`] is clamped up to it. A tick that arrives while
    /// a previous check is still running is dropped rather than queued, so
    /// overlapping checks never pile up against a slow network.
    pub async fn check_periodically(self: &Arc<Self>, interval: Option<Duration>) {
        let interval = interval.unwrap_or(DEFAULT_INTERVAL).max(MIN_INTERVAL);
        self.stop_checking_periodically().await;
        let controller = Arc::clone(self);
        let checking = Arc::clone(&self.checking);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if checking.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let _ = controller.check_for_updates().await;
                checking.store(false, Ordering::SeqCst);
            }
        });
        *self.periodic_handle.lock().await = Some(handle);
    }

    /// Stop the periodic polling loop started by `check_periodically`, if
    /// one is running.
    pub async fn stop_checking_periodically(&self) {
        if let Some(handle) = self.periodic_handle.lock().await.take() {
            handle.abort();
        }
    }
}

/// Among non-draft GitHub release JSON objects (prerelease entries included
/// only when `allow_prerelease` is set), find the one whose `tag_name` is
/// the semver-greatest and strictly newer than `current` — per `spec.md`
/// §4.G's "select the release with the semver-greatest `tag_name`", not the
/// first eligible entry in API response order. Releases whose `tag_name`
/// isn't valid semver (optionally `v`-prefixed) are skipped rather than
/// rejected outright, since a repo's release history commonly carries
/// unrelated non-version tags.
fn select_newest_eligible_release<'a>(
    pages: &'a [Value],
    allow_prerelease: bool,
    current: &Version,
) -> Option<&'a Value> {
    let mut best: Option<(Version, &Value)> = None;
    for release in pages {
        if release.get("draft").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let prerelease = release
            .get("prerelease")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if prerelease && !allow_prerelease {
            continue;
        }
        let Some(tag_name) = release.get("tag_name").and_then(Value::as_str) else {
            continue;
        };
        let Ok(tag_version) = Version::parse(tag_name.trim_start_matches('v')) else {
            continue;
        };
        if best.as_ref().is_none_or(|(current_best, _)| tag_version > *current_best) {
            best = Some((tag_version, release));
        }
    }
    match best {
        Some((version, release)) if version > *current => Some(release),
        _ => None,
    }
}

/// The name of the environment variable the host sets, on Linux, to the
/// running executable's path — `spec.md` §6 leaves the variable name as "an
/// integration detail not constrained here"; this crate picks one rather
/// than leaving the behavior unimplemented.
const RELAUNCH_EXECUTABLE_ENV_VAR: &str = "UPDATEKIT_EXECUTABLE_PATH";

/// On Linux, the executable path the host supplied via
/// [`RELAUNCH_EXECUTABLE_ENV_VAR`] so a relaunch after install can target
/// the right binary. `None` on any other platform, or if the host never set
/// the variable.
pub fn relaunch_executable_path() -> Option<PathBuf> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    std::env::var_os(RELAUNCH_EXECUTABLE_ENV_VAR).map(PathBuf::from)
}

/// 10 bytes of cryptographic randomness, hex-encoded, for the temp
/// filename a download is written to (`peerio-update-<hex>.tmp`) per
/// `spec.md` §4.G — this avoids collisions between overlapping downloads
/// sharing a downloads directory.
fn random_temp_suffix() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 10];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Assembles an [`UpdateController`] and the event channel it reports on.
pub struct ControllerBuilder {
    config: Option<UpdaterConfig>,
    fetcher: Option<Fetcher>,
    installer: Option<Arc<dyn Installer>>,
    on_shutdown: Option<Arc<dyn OnShutdown>>,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            fetcher: None,
            installer: None,
            on_shutdown: None,
        }
    }

    pub fn config(mut self, config: UpdaterConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Wire the host's "before-quit" signal. Defaults to
    /// [`ProcessExitOnShutdown`] (wait for the process's own termination
    /// signal) when not set, per spec.md §4.G's "if no host integration is
    /// available, wire to process exit".
    pub fn on_shutdown(mut self, on_shutdown: Arc<dyn OnShutdown>) -> Self {
        self.on_shutdown = Some(on_shutdown);
        self
    }

    pub fn build(self) -> Result<(Arc<UpdateController>, mpsc::UnboundedReceiver<UpdateEvent>)> {
        let config = self
            .config
            .ok_or_else(|| UpdaterError::ConfigInvalid("missing updater configuration".to_string()))?;
        let public_keys = config.decode_public_keys()?;
        let installer = self
            .installer
            .ok_or_else(|| UpdaterError::ConfigInvalid("missing installer".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();

        let controller = UpdateController {
            config,
            fetcher: self.fetcher.unwrap_or_default(),
            public_keys,
            installer,
            state: Mutex::new(ControllerState::Idle),
            events: tx,
            periodic_handle: Mutex::new(None),
            checking: Arc::new(AtomicBool::new(false)),
            downloading: AtomicBool::new(false),
            downloaded_file: StdMutex::new(None),
            pending_install: StdMutex::new(None),
            on_shutdown: self.on_shutdown.unwrap_or_else(|| Arc::new(ProcessExitOnShutdown)),
            exit_hook_armed: AtomicBool::new(false),
        };

        Ok((Arc::new(controller), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::NoopInstaller;
    use crate::manifest::Manifest;
    use crate::signer::generate_keypair;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn selects_the_semver_greatest_release_not_the_first_eligible_one() {
        // Deliberately out of semver order, as a backport release commonly
        // appears after a newer major in GitHub's creation-time ordering.
        let pages = vec![
            json!({"tag_name": "v2.0.0", "draft": false, "prerelease": false}),
            json!({"tag_name": "v1.5.1", "draft": false, "prerelease": false}),
            json!({"tag_name": "v3.0.0", "draft": false, "prerelease": false}),
        ];
        let current = Version::parse("1.0.0").unwrap();
        let release = select_newest_eligible_release(&pages, false, &current).unwrap();
        assert_eq!(release["tag_name"], "v3.0.0");
    }

    #[test]
    fn skips_draft_and_gated_prerelease_releases() {
        let pages = vec![
            json!({"tag_name": "v9.0.0", "draft": true, "prerelease": false}),
            json!({"tag_name": "v8.0.0", "draft": false, "prerelease": true}),
            json!({"tag_name": "v1.2.0", "draft": false, "prerelease": false}),
        ];
        let current = Version::parse("1.0.0").unwrap();
        let release = select_newest_eligible_release(&pages, false, &current).unwrap();
        assert_eq!(release["tag_name"], "v1.2.0");
    }

    #[test]
    fn prerelease_is_eligible_when_allowed() {
        let pages = vec![
            json!({"tag_name": "v8.0.0-beta.1", "draft": false, "prerelease": true}),
            json!({"tag_name": "v1.2.0", "draft": false, "prerelease": false}),
        ];
        let current = Version::parse("1.0.0").unwrap();
        let release = select_newest_eligible_release(&pages, true, &current).unwrap();
        assert_eq!(release["tag_name"], "v8.0.0-beta.1");
    }

    #[test]
    fn returns_none_when_nothing_is_newer_than_current() {
        let pages = vec![
            json!({"tag_name": "v1.0.0", "draft": false, "prerelease": false}),
            json!({"tag_name": "v0.9.0", "draft": false, "prerelease": false}),
        ];
        let current = Version::parse("1.0.0").unwrap();
        assert!(select_newest_eligible_release(&pages, false, &current).is_none());
    }

    #[test]
    fn ignores_tags_that_are_not_valid_semver() {
        let pages = vec![
            json!({"tag_name": "release-notes", "draft": false, "prerelease": false}),
            json!({"tag_name": "v1.3.0", "draft": false, "prerelease": false}),
        ];
        let current = Version::parse("1.0.0").unwrap();
        let release = select_newest_eligible_release(&pages, false, &current).unwrap();
        assert_eq!(release["tag_name"], "v1.3.0");
    }

    fn test_config(downloads_directory: PathBuf, public_key_b64: String) -> UpdaterConfig {
        UpdaterConfig {
            version: Version::parse("1.0.0").unwrap(),
            public_keys: vec![crate::config::PublicKeyConfig(public_key_b64)],
            manifests: vec![],
            nightly: false,
            allow_prerelease: false,
            auto_install: false,
            downloads_directory,
        }
    }

    #[tokio::test]
    async fn check_for_updates_reports_no_update_for_older_manifest() {
        let (public, _secret) = generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let manifest = Manifest::builder("0.9.0").build().unwrap();
        assert!(!manifest.is_newer_version_than(&controller.config.version));
    }

    #[tokio::test]
    async fn download_persists_update_info_and_verifies_artifact() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        let mock = server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();
        let _ = secret;

        let path = controller.download(&manifest).await.unwrap();
        assert!(path.exists());
        mock.assert();

        let info = UpdateInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(info.attempts, 0);
        assert_eq!(info.update_version, "1.1.0");
    }

    #[tokio::test]
    async fn download_leaves_attempts_nonzero_on_hash_mismatch() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                "0".repeat(128),
            )
            .build()
            .unwrap();

        let err = controller.download(&manifest).await.unwrap_err();
        assert!(matches!(err, UpdaterError::HashMismatch { .. }));

        let info = UpdateInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(info.attempts, 1);
    }

    #[tokio::test]
    async fn download_rejects_a_concurrent_call_on_the_same_controller() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        // Delay the response so the second `download` call overlaps the first.
        server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).delay(Duration::from_millis(200)).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();

        let first = controller.download(&manifest);
        let second = controller.download(&manifest);
        let (first, second) = tokio::join!(first, second);

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(UpdaterError::DownloadInProgress))));
    }

    #[tokio::test]
    async fn quit_and_install_errors_without_a_scheduled_artifact() {
        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let err = controller.resolve_install_path(None).await.unwrap_err();
        assert!(matches!(err, UpdaterError::NothingToInstall));
    }

    #[tokio::test]
    async fn schedule_install_on_quit_records_pending_path() {
        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, mut rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let artifact = dir.path().join("app.bin");
        controller.schedule_install_on_quit(artifact.clone()).await;
        assert_eq!(controller.state().await, ControllerState::InstallScheduled);

        let resolved = controller.resolve_install_path(None).await.unwrap();
        assert_eq!(resolved, artifact);

        match rx.recv().await.unwrap() {
            UpdateEvent::InstallScheduled { path } => assert_eq!(path, artifact),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    /// An [`Installer`] that always fails, for exercising
    /// `quit_and_retry_install`'s failure path without ever reaching the
    /// `std::process::exit` on its success path.
    struct FailingInstaller;

    impl Installer for FailingInstaller {
        fn install(&self, _artifact_path: &std::path::Path, _restart: bool) -> Result<()> {
            Err(UpdaterError::UnknownPlatformInstaller)
        }
    }

    #[tokio::test]
    async fn quit_and_retry_install_records_another_attempt_on_installer_failure() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(FailingInstaller))
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();

        controller.download(&manifest).await.unwrap();
        let before = UpdateInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(before.attempts, 0);

        let err = controller
            .quit_and_retry_install(true)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdaterError::UnknownPlatformInstaller));

        let after = UpdateInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(after.attempts, 1);
    }

    #[tokio::test]
    async fn quit_and_retry_install_reuses_a_valid_local_artifact_without_redownloading() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        let mock = server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(FailingInstaller))
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();

        controller.download(&manifest).await.unwrap();
        mock.assert_hits(1);

        let _ = controller.quit_and_retry_install(true).await.unwrap_err();

        // The artifact is reused from disk; the HTTP mock was never hit again.
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn check_periodically_starts_and_stops_a_background_loop() {
        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        controller
            .check_periodically(Some(Duration::from_millis(5)))
            .await;
        assert!(controller.periodic_handle.lock().await.is_some());

        controller.stop_checking_periodically().await;
        assert!(controller.periodic_handle.lock().await.is_none());
    }

    #[test]
    fn default_and_min_interval_match_spec_constants() {
        assert_eq!(DEFAULT_INTERVAL, Duration::from_secs(10 * 60 * 60));
        assert_eq!(MIN_INTERVAL, Duration::from_secs(15 * 60));
    }

    #[test]
    fn relaunch_executable_path_is_none_without_the_host_env_var() {
        // SAFETY: test-only, no other thread in this process reads/writes
        // this variable.
        unsafe {
            std::env::remove_var(RELAUNCH_EXECUTABLE_ENV_VAR);
        }
        assert_eq!(relaunch_executable_path(), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn relaunch_executable_path_reads_the_host_env_var_on_linux() {
        // SAFETY: test-only, no other thread in this process reads/writes
        // this variable.
        unsafe {
            std::env::set_var(RELAUNCH_EXECUTABLE_ENV_VAR, "/opt/app/bin/app");
        }
        assert_eq!(
            relaunch_executable_path(),
            Some(PathBuf::from("/opt/app/bin/app"))
        );
        unsafe {
            std::env::remove_var(RELAUNCH_EXECUTABLE_ENV_VAR);
        }
    }

    #[derive(Default)]
    struct CountingOnShutdown {
        registrations: std::sync::atomic::AtomicUsize,
    }

    impl OnShutdown for CountingOnShutdown {
        fn register(&self, _callback: crate::installer::ShutdownCallback) {
            self.registrations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn schedule_install_on_quit_arms_the_exit_hook_exactly_once() {
        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let on_shutdown = Arc::new(CountingOnShutdown::default());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .on_shutdown(on_shutdown.clone())
            .build()
            .unwrap();

        let first = dir.path().join("app-1.bin");
        let second = dir.path().join("app-2.bin");
        controller.schedule_install_on_quit(first).await;
        controller.schedule_install_on_quit(second.clone()).await;

        // "installs once": a second call updates the pending path but never
        // re-registers with the host.
        assert_eq!(on_shutdown.registrations.load(Ordering::SeqCst), 1);
        let resolved = controller.resolve_install_path(None).await.unwrap();
        assert_eq!(resolved, second);
    }

    #[tokio::test]
    async fn download_arms_the_exit_hook_when_auto_install_is_set() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf(), public.to_base64());
        config.auto_install = true;
        let on_shutdown = Arc::new(CountingOnShutdown::default());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .on_shutdown(on_shutdown.clone())
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();

        controller.download(&manifest).await.unwrap();

        assert_eq!(on_shutdown.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state().await, ControllerState::InstallScheduled);
        let info = UpdateInfo::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(info.attempts, 1);
    }

    #[tokio::test]
    async fn download_does_not_arm_the_exit_hook_without_auto_install() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let contents = b"artifact-bytes";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        server.mock(|when, then| {
            when.method(GET).path("/app-1.1.0.bin");
            then.status(200).body(contents);
        });

        let (public, _secret) = crate::signer::generate_keypair();
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf(), public.to_base64());
        let on_shutdown = Arc::new(CountingOnShutdown::default());
        let (controller, _rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .on_shutdown(on_shutdown.clone())
            .build()
            .unwrap();

        let manifest = Manifest::builder("1.1.0")
            .platform(
                platform::host_platform_key().unwrap(),
                server.url("/app-1.1.0.bin"),
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();

        controller.download(&manifest).await.unwrap();

        assert_eq!(on_shutdown.registrations.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state().await, ControllerState::ReadyToInstall);
    }

    #[tokio::test]
    async fn check_for_updates_starts_a_concurrent_download_for_a_newer_manifest() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let (public, secret) = crate::signer::generate_keypair();
        let contents = b"a shiny new build";
        let digest = {
            use sha2::{Digest, Sha512};
            hex::encode(Sha512::digest(contents))
        };
        let artifact_url = server.url("/app-1.5.0.bin");

        let manifest = Manifest::builder("1.5.0")
            .platform(
                platform::host_platform_key().unwrap(),
                artifact_url,
                contents.len() as u64,
                digest,
            )
            .build()
            .unwrap();
        let manifest_body = manifest.serialize(&secret);

        server.mock(|when, then| {
            when.method(GET).path("/manifest.txt");
            then.status(200).body(&manifest_body);
        });
        server.mock(|when, then| {
            when.method(GET).path("/app-1.5.0.bin");
            then.status(200).body(contents.to_vec());
        });

        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf(), public.to_base64());
        config.manifests = vec![ManifestSource::parse(&server.url("/manifest.txt")).unwrap()];
        let (controller, mut rx) = UpdateController::builder()
            .config(config)
            .installer(Arc::new(NoopInstaller::default()))
            .build()
            .unwrap();

        let found = controller.check_for_updates().await.unwrap();
        assert!(found.is_some());

        let mut saw_download_complete = false;
        while let Some(event) = rx.recv().await {
            match event {
                UpdateEvent::DownloadComplete { path } => {
                    assert!(path.exists());
                    saw_download_complete = true;
                    break;
                }
                UpdateEvent::DownloadFailed { message } => panic!("download failed: {message}"),
                _ => {}
            }
        }
        assert!(saw_download_complete);
    }
}

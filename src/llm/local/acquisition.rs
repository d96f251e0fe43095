// src/llm/local/acquisition.rs
// Lifecycle management for the on-device model file: startup detection,
// bundled-asset restoration, supervised download, stall recovery, cleanup.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::download::{Downloader, ProgressCallback};
use super::{DeviceProbe, DownloadState, LocalLlmError};
use crate::config::Config;

/// Acquisition policy and file-layout settings.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub models_dir: PathBuf,
    pub filename: String,
    pub expected_bytes: u64,
    pub min_valid_bytes: u64,
    pub safety_margin_bytes: u64,
    pub primary_url: String,
    pub secondary_url: String,
    /// Candidate locations for a pre-delivered copy, most specific first.
    pub bundled_dirs: Vec<PathBuf>,
    pub max_attempts: u32,
    pub stall_window: Duration,
    pub progress_interval: Duration,
    pub auto_start: bool,
}

impl AcquisitionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models_dir: PathBuf::from(&config.models_dir),
            filename: config.model_filename.clone(),
            expected_bytes: config.model_expected_bytes,
            min_valid_bytes: config.model_min_valid_bytes,
            safety_margin_bytes: config.storage_safety_margin_bytes,
            primary_url: config.model_primary_url.clone(),
            secondary_url: config.model_secondary_url.clone(),
            bundled_dirs: config.bundled_asset_dirs.iter().map(PathBuf::from).collect(),
            max_attempts: config.download_max_attempts,
            stall_window: Duration::from_secs(config.download_stall_window_secs),
            progress_interval: Duration::from_millis(config.download_progress_interval_ms),
            auto_start: config.auto_start_download,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(&self.filename)
    }

    /// The `.tmp` sidecar. Its on-disk size is the authoritative resume
    /// offset for an interrupted download.
    pub fn tmp_path(&self) -> PathBuf {
        self.models_dir.join(format!("{}.tmp", self.filename))
    }
}

/// Serializable snapshot for the (excluded) UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionStatus {
    pub state: DownloadState,
    pub message: String,
    pub model_path: Option<PathBuf>,
    pub downloaded_bytes: u64,
    pub expected_bytes: u64,
}

/// State shared between the public handle and its background tasks.
struct Shared {
    settings: Arc<AcquisitionSettings>,
    probe: Arc<dyn DeviceProbe>,
    state_tx: watch::Sender<DownloadState>,
    ready_fired: AtomicBool,
    download_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> DownloadState {
        self.state_tx.borrow().clone()
    }

    /// Single state setter. `Completed` fires at most once per acquisition
    /// and triggers stale-file cleanup.
    fn set_state(&self, state: DownloadState) {
        if matches!(state, DownloadState::Completed) {
            if !self.ready_fired.swap(true, Ordering::SeqCst) {
                self.state_tx.send_replace(DownloadState::Completed);
                info!("model ready");
                let settings = Arc::clone(&self.settings);
                tokio::spawn(async move {
                    cleanup_stale_models(&settings).await;
                });
            }
            return;
        }
        self.state_tx.send_replace(state);
    }

    /// Storage and network gates for starting a download. `None` means both
    /// are satisfied.
    fn check_preconditions(&self) -> Option<DownloadState> {
        let need_bytes = self.settings.expected_bytes + self.settings.safety_margin_bytes;
        let have_bytes = self.probe.free_storage_bytes(&self.settings.models_dir);
        if have_bytes < need_bytes {
            return Some(DownloadState::NeedsStorage {
                need_bytes,
                have_bytes,
            });
        }
        if !self.probe.is_unmetered_network() {
            return Some(DownloadState::WaitingForWifi);
        }
        None
    }

    async fn file_is_valid(&self, path: &Path) -> bool {
        match fs::metadata(path).await {
            Ok(meta) => meta.is_file() && meta.len() >= self.settings.min_valid_bytes,
            Err(_) => false,
        }
    }

    async fn abort_download(&self) {
        if let Some(task) = self.download_task.lock().await.take() {
            task.abort();
        }
    }
}

/// The model acquisition state machine.
///
/// Constructed once by the composition root; the lifecycle state is
/// observable through [`ModelAcquisition::subscribe`].
pub struct ModelAcquisition {
    shared: Arc<Shared>,
    downloader: Arc<Downloader>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl ModelAcquisition {
    pub fn new(
        settings: AcquisitionSettings,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<Self, LocalLlmError> {
        let settings = Arc::new(settings);
        let downloader = Arc::new(Downloader::new(settings.clone())?);
        let (state_tx, _) = watch::channel(DownloadState::NotStarted);
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                probe,
                state_tx,
                ready_fired: AtomicBool::new(false),
                download_task: Mutex::new(None),
            }),
            downloader,
            watchdog_task: Mutex::new(None),
        })
    }

    /// Observe state transitions. The receiver sees `Completed` at most once
    /// per acquisition.
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> DownloadState {
        self.shared.state()
    }

    /// Startup detection and (if allowed) download kick-off.
    ///
    /// Order: valid local file, then bundled-asset restoration, then storage
    /// and network preconditions, then auto-start policy.
    #[instrument(skip(self))]
    pub async fn ensure_model(&self) -> Result<DownloadState, LocalLlmError> {
        fs::create_dir_all(&self.shared.settings.models_dir)
            .await
            .map_err(|e| LocalLlmError::ModelMissing(format!("cannot create models dir: {e}")))?;

        if self
            .shared
            .file_is_valid(&self.shared.settings.model_path())
            .await
        {
            info!("found valid model on startup");
            self.shared.set_state(DownloadState::Completed);
            return Ok(self.state());
        }

        if self.restore_bundled_asset().await? {
            info!("restored model from bundled asset");
            self.shared.set_state(DownloadState::Completed);
            return Ok(self.state());
        }

        if let Some(blocked) = self.shared.check_preconditions() {
            self.shared.set_state(blocked);
            return Ok(self.state());
        }

        self.shared.set_state(DownloadState::NotStarted);
        if self.shared.settings.auto_start {
            self.start_download().await;
        }
        Ok(self.state())
    }

    /// Copies the first valid pre-delivered model file into the models dir.
    async fn restore_bundled_asset(&self) -> Result<bool, LocalLlmError> {
        for dir in &self.shared.settings.bundled_dirs {
            let candidate = dir.join(&self.shared.settings.filename);
            if !self.shared.file_is_valid(&candidate).await {
                continue;
            }
            debug!(from = %candidate.display(), "restoring bundled model asset");
            fs::copy(&candidate, self.shared.settings.model_path())
                .await
                .map_err(|e| {
                    LocalLlmError::ModelMissing(format!("bundled asset copy failed: {e}"))
                })?;
            if self
                .shared
                .file_is_valid(&self.shared.settings.model_path())
                .await
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Starts (or restarts) the supervised download task and its stall
    /// watchdog. A previous in-flight task is superseded.
    pub async fn start_download(&self) {
        spawn_download_task(&self.shared, &self.downloader).await;
        self.spawn_watchdog().await;
    }

    async fn spawn_watchdog(&self) {
        let mut guard = self.watchdog_task.lock().await;
        if guard.is_some() {
            return;
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let downloader = Arc::clone(&self.downloader);
        let stall_window = self.shared.settings.stall_window;
        let check_every = (stall_window / 4).max(Duration::from_secs(1));

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_size = 0u64;
            let mut last_growth = Instant::now();

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };

                match shared.state() {
                    DownloadState::Completed | DownloadState::Failed { .. } => break,
                    DownloadState::NeedsStorage { .. } | DownloadState::WaitingForWifi => break,
                    DownloadState::NotStarted | DownloadState::Downloading { .. } => {}
                }

                let tmp_size = fs::metadata(shared.settings.tmp_path())
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);

                if tmp_size > last_size {
                    last_size = tmp_size;
                    last_growth = Instant::now();
                    continue;
                }

                if last_growth.elapsed() < stall_window {
                    continue;
                }

                // Stalled. Either a precondition broke underneath us, or the
                // transfer wedged and the task must be requeued.
                if let Some(blocked) = shared.check_preconditions() {
                    warn!(?blocked, "download stalled on a broken precondition");
                    shared.abort_download().await;
                    shared.set_state(blocked);
                    break;
                }
                warn!(
                    stalled_for = ?last_growth.elapsed(),
                    "download stalled with preconditions intact, requeueing"
                );
                spawn_download_task(&shared, &downloader).await;
                last_growth = Instant::now();
            }
        }));
    }

    /// Path to the validated model file, for the inference adapter.
    ///
    /// # Errors
    ///
    /// `ModelMissing` (with the current state's user-facing message) when no
    /// valid file exists yet.
    pub async fn model_path(&self) -> Result<PathBuf, LocalLlmError> {
        let path = self.shared.settings.model_path();
        if self.shared.file_is_valid(&path).await {
            Ok(path)
        } else {
            Err(LocalLlmError::ModelMissing(self.state().user_message()))
        }
    }

    pub async fn status(&self) -> AcquisitionStatus {
        let state = self.state();
        let final_path = self.shared.settings.model_path();
        let downloaded_bytes = match fs::metadata(&final_path).await {
            Ok(meta) => meta.len(),
            Err(_) => fs::metadata(self.shared.settings.tmp_path())
                .await
                .map(|m| m.len())
                .unwrap_or(0),
        };
        AcquisitionStatus {
            message: state.user_message(),
            model_path: self
                .shared
                .file_is_valid(&final_path)
                .await
                .then_some(final_path),
            downloaded_bytes,
            expected_bytes: self.shared.settings.expected_bytes,
            state,
        }
    }

    /// Stops the watchdog and any in-flight download task.
    pub async fn shutdown(&self) {
        self.shared.abort_download().await;
        if let Some(task) = self.watchdog_task.lock().await.take() {
            task.abort();
        }
    }
}

/// Spawns the download task, superseding any previous one. The task reports
/// progress through the shared state channel and settles into `Completed`
/// or `Failed`.
async fn spawn_download_task(shared: &Arc<Shared>, downloader: &Arc<Downloader>) {
    let mut guard = shared.download_task.lock().await;
    if let Some(old) = guard.take() {
        old.abort();
    }

    let resume_offset = fs::metadata(shared.settings.tmp_path())
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let initial = if shared.settings.expected_bytes > 0 {
        resume_offset as f32 / shared.settings.expected_bytes as f32
    } else {
        0.0
    };
    shared
        .state_tx
        .send_replace(DownloadState::Downloading { progress: initial });

    let progress_shared = Arc::clone(shared);
    let progress: ProgressCallback = Arc::new(move |downloaded, total| {
        let progress = if total > 0 {
            downloaded as f32 / total as f32
        } else {
            0.0
        };
        progress_shared
            .state_tx
            .send_replace(DownloadState::Downloading { progress });
    });

    let task_shared = Arc::clone(shared);
    let downloader = Arc::clone(downloader);
    *guard = Some(tokio::spawn(async move {
        match downloader.run(progress).await {
            Ok(_path) => {
                task_shared.set_state(DownloadState::Completed);
            }
            Err(err) => {
                warn!(%err, "model download failed after all attempts");
                task_shared.set_state(DownloadState::Failed {
                    message: err.to_string(),
                });
            }
        }
    }));
}

/// Deletes other model files and sidecars in the models directory once a
/// model is in place, reclaiming space.
async fn cleanup_stale_models(settings: &AcquisitionSettings) {
    let Ok(mut entries) = fs::read_dir(&settings.models_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if name == settings.filename {
            continue;
        }
        debug!(file = %name, "removing stale model file");
        let _ = fs::remove_file(entry.path()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FixedProbe;
    use tempfile::TempDir;

    fn settings_in(dir: &TempDir) -> AcquisitionSettings {
        AcquisitionSettings {
            models_dir: dir.path().join("models"),
            filename: "coach.gguf".to_string(),
            expected_bytes: 1_000,
            min_valid_bytes: 100,
            safety_margin_bytes: 500,
            primary_url: "http://127.0.0.1:9/model".to_string(),
            secondary_url: "http://127.0.0.1:9/model".to_string(),
            bundled_dirs: vec![dir.path().join("bundle")],
            max_attempts: 1,
            stall_window: Duration::from_secs(30),
            progress_interval: Duration::from_millis(100),
            auto_start: false,
        }
    }

    #[tokio::test]
    async fn startup_detection_finds_existing_model() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.models_dir).unwrap();
        std::fs::write(settings.model_path(), vec![0u8; 200]).unwrap();

        let acquisition = ModelAcquisition::new(settings, Arc::new(FixedProbe::plenty())).unwrap();
        let state = acquisition.ensure_model().await.unwrap();
        assert_eq!(state, DownloadState::Completed);
        assert!(acquisition.model_path().await.is_ok());
    }

    #[tokio::test]
    async fn undersized_file_is_not_valid() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.models_dir).unwrap();
        // Below min_valid_bytes: a truncated download must not count.
        std::fs::write(settings.model_path(), vec![0u8; 50]).unwrap();

        let acquisition = ModelAcquisition::new(settings, Arc::new(FixedProbe::plenty())).unwrap();
        let state = acquisition.ensure_model().await.unwrap();
        assert_ne!(state, DownloadState::Completed);
        assert!(acquisition.model_path().await.is_err());
    }

    #[tokio::test]
    async fn bundled_asset_is_restored() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let bundle_dir = &settings.bundled_dirs[0];
        std::fs::create_dir_all(bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("coach.gguf"), vec![1u8; 300]).unwrap();

        let acquisition =
            ModelAcquisition::new(settings.clone(), Arc::new(FixedProbe::plenty())).unwrap();
        let state = acquisition.ensure_model().await.unwrap();
        assert_eq!(state, DownloadState::Completed);
        assert!(settings.model_path().exists());
    }

    #[tokio::test]
    async fn missing_storage_blocks_download() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let acquisition = ModelAcquisition::new(
            settings,
            Arc::new(FixedProbe::new(200, true)), // < expected + margin
        )
        .unwrap();
        let state = acquisition.ensure_model().await.unwrap();
        assert_eq!(
            state,
            DownloadState::NeedsStorage {
                need_bytes: 1_500,
                have_bytes: 200
            }
        );
    }

    #[tokio::test]
    async fn metered_network_blocks_download() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let acquisition =
            ModelAcquisition::new(settings, Arc::new(FixedProbe::new(u64::MAX, false))).unwrap();
        let state = acquisition.ensure_model().await.unwrap();
        assert_eq!(state, DownloadState::WaitingForWifi);
    }

    #[tokio::test]
    async fn ready_notification_fires_exactly_once() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.models_dir).unwrap();
        std::fs::write(settings.model_path(), vec![0u8; 200]).unwrap();

        let acquisition = ModelAcquisition::new(settings, Arc::new(FixedProbe::plenty())).unwrap();
        let mut rx = acquisition.subscribe();

        acquisition.ensure_model().await.unwrap();
        acquisition.ensure_model().await.unwrap();

        // First change is the Completed transition.
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DownloadState::Completed);
        // No second notification is pending.
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn completion_cleans_up_stale_files() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.models_dir).unwrap();
        std::fs::write(settings.model_path(), vec![0u8; 200]).unwrap();
        let stale = settings.models_dir.join("old-coach.gguf");
        let sidecar = settings.models_dir.join("coach.gguf.tmp");
        std::fs::write(&stale, vec![0u8; 150]).unwrap();
        std::fs::write(&sidecar, vec![0u8; 10]).unwrap();

        let acquisition =
            ModelAcquisition::new(settings.clone(), Arc::new(FixedProbe::plenty())).unwrap();
        acquisition.ensure_model().await.unwrap();

        // Cleanup runs on a background task.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stale.exists());
        assert!(!sidecar.exists());
        assert!(settings.model_path().exists());
    }

    #[tokio::test]
    async fn status_reports_progress_toward_expected_size() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        std::fs::create_dir_all(&settings.models_dir).unwrap();
        std::fs::write(settings.tmp_path(), vec![0u8; 400]).unwrap();

        let acquisition =
            ModelAcquisition::new(settings, Arc::new(FixedProbe::plenty())).unwrap();
        let status = acquisition.status().await;
        assert_eq!(status.downloaded_bytes, 400);
        assert_eq!(status.expected_bytes, 1_000);
        assert!(status.model_path.is_none());
    }
}
